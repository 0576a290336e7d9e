//! Decoder for the fixed-layout sample packets the SPE PMU writes into the
//! aux ring. The layout matches the collection config programmed into the
//! hardware event (load and branch collection, physical timestamps).

use byteorder::{ByteOrder, LittleEndian};

pub const SPE_PACKET_SIZE: usize = 64;

pub const PACKET_TYPE_LATENCY: u8 = 0x49;
pub const PACKET_TYPE_BRANCH: u8 = 0x4a;

/// Branch kind values carried in the operation byte.
pub const BRANCH_KIND_CONDITIONAL: u8 = 0x01;

/// `issue_lat` value marking a sample whose latency counters overflowed.
pub const ISSUE_LATENCY_SATURATED: u16 = 4095;

pub const EVENT_RETIRED: u32 = 1 << 1;
pub const EVENT_BRANCH_NOT_TAKEN: u32 = 1 << 6;
pub const EVENT_BRANCH_MISS: u32 = 1 << 7;

pub const DATA_SOURCE_L1: u8 = 0b0000;
pub const DATA_SOURCE_L2: u8 = 0b1000;
pub const DATA_SOURCE_PEER_CORE: u8 = 0b1001;
pub const DATA_SOURCE_LOCAL_CLUSTER: u8 = 0b1010;
pub const DATA_SOURCE_SYSTEM_CACHE: u8 = 0b1011;
pub const DATA_SOURCE_PEER_CLUSTER: u8 = 0b1100;
pub const DATA_SOURCE_REMOTE: u8 = 0b1101;
pub const DATA_SOURCE_DRAM: u8 = 0b1110;

/// The cache level that completed a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTier {
    L1 = 0,
    L2 = 1,
    L3 = 2,
    Dram = 3,
}

impl CompletionTier {
    /// Anything that is not a recognized cache level is attributed to DRAM.
    pub fn from_data_source(data_source: u8) -> CompletionTier {
        match data_source {
            DATA_SOURCE_L1 => CompletionTier::L1,
            DATA_SOURCE_L2 => CompletionTier::L2,
            DATA_SOURCE_LOCAL_CLUSTER | DATA_SOURCE_PEER_CLUSTER | DATA_SOURCE_SYSTEM_CACHE => {
                CompletionTier::L3
            }
            _ => CompletionTier::Dram,
        }
    }
}

/// One decoded SPE sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpePacket {
    /// Program counter, zero-extended from the 7 bytes the PMU emits.
    pub pc: u64,
    /// Packet type: `PACKET_TYPE_LATENCY` or `PACKET_TYPE_BRANCH`.
    pub kind: u8,
    /// Operation payload byte; for branch packets this is the branch kind.
    pub branch_type: u8,
    pub events: u32,
    pub issue_lat: u16,
    pub total_lat: u16,
    pub translation_lat: u16,
    pub virtual_address: u64,
    pub data_source: u8,
    /// SPE cycle timestamp; converted to the perf clock by the session.
    pub timestamp: u64,
}

impl SpePacket {
    pub fn parse(bytes: &[u8; SPE_PACKET_SIZE]) -> SpePacket {
        SpePacket {
            pc: LittleEndian::read_uint(&bytes[1..8], 7),
            kind: bytes[19],
            branch_type: bytes[20],
            events: LittleEndian::read_u32(&bytes[22..26]),
            issue_lat: LittleEndian::read_u16(&bytes[27..29]),
            total_lat: LittleEndian::read_u16(&bytes[30..32]),
            virtual_address: LittleEndian::read_u64(&bytes[32..40]),
            translation_lat: LittleEndian::read_u16(&bytes[42..44]),
            data_source: bytes[54],
            timestamp: LittleEndian::read_u64(&bytes[56..64]),
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.issue_lat == ISSUE_LATENCY_SATURATED
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a raw packet with the given fields at their wire offsets.
    pub(crate) fn raw_packet(packet: &SpePacket) -> [u8; SPE_PACKET_SIZE] {
        let mut bytes = [0u8; SPE_PACKET_SIZE];
        LittleEndian::write_uint(&mut bytes[1..8], packet.pc & 0x00ff_ffff_ffff_ffff, 7);
        bytes[19] = packet.kind;
        bytes[20] = packet.branch_type;
        LittleEndian::write_u32(&mut bytes[22..26], packet.events);
        LittleEndian::write_u16(&mut bytes[27..29], packet.issue_lat);
        LittleEndian::write_u16(&mut bytes[30..32], packet.total_lat);
        LittleEndian::write_u64(&mut bytes[32..40], packet.virtual_address);
        LittleEndian::write_u16(&mut bytes[42..44], packet.translation_lat);
        bytes[54] = packet.data_source;
        LittleEndian::write_u64(&mut bytes[56..64], packet.timestamp);
        bytes
    }

    #[test]
    fn parse_roundtrips_wire_offsets() {
        let packet = SpePacket {
            pc: 0x0000_aabb_ccdd_eeff,
            kind: PACKET_TYPE_LATENCY,
            branch_type: 0,
            events: EVENT_RETIRED,
            issue_lat: 10,
            total_lat: 20,
            translation_lat: 2,
            virtual_address: 0xffff_0000_1234_5678,
            data_source: DATA_SOURCE_L2,
            timestamp: 0x1122_3344_5566_7788,
        };
        assert_eq!(SpePacket::parse(&raw_packet(&packet)), packet);
    }

    #[test]
    fn pc_top_byte_is_zero_extended() {
        let mut bytes = [0u8; SPE_PACKET_SIZE];
        // All ones in the 7 PC bytes; the reserved byte after them set too.
        for b in &mut bytes[1..9] {
            *b = 0xff;
        }
        let packet = SpePacket::parse(&bytes);
        assert_eq!(packet.pc, 0x00ff_ffff_ffff_ffff);
    }

    #[test]
    fn saturation_sentinel() {
        let mut bytes = [0u8; SPE_PACKET_SIZE];
        LittleEndian::write_u16(&mut bytes[27..29], ISSUE_LATENCY_SATURATED);
        assert!(SpePacket::parse(&bytes).is_saturated());

        LittleEndian::write_u16(&mut bytes[27..29], 4094);
        assert!(!SpePacket::parse(&bytes).is_saturated());
    }

    #[test]
    fn data_source_tiers() {
        assert_eq!(
            CompletionTier::from_data_source(DATA_SOURCE_L1),
            CompletionTier::L1
        );
        assert_eq!(
            CompletionTier::from_data_source(DATA_SOURCE_L2),
            CompletionTier::L2
        );
        for source in [
            DATA_SOURCE_LOCAL_CLUSTER,
            DATA_SOURCE_PEER_CLUSTER,
            DATA_SOURCE_SYSTEM_CACHE,
        ] {
            assert_eq!(
                CompletionTier::from_data_source(source),
                CompletionTier::L3
            );
        }
        // Peer core, remote and unknown encodings all land in the DRAM tier.
        for source in [DATA_SOURCE_PEER_CORE, DATA_SOURCE_REMOTE, DATA_SOURCE_DRAM, 0x7] {
            assert_eq!(
                CompletionTier::from_data_source(source),
                CompletionTier::Dram
            );
        }
    }
}
