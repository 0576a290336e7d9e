//! Aggregation of SPE branch samples by file location.

use std::collections::BTreeMap;
use std::io::{self, Write};

use log::warn;

use crate::file_registry::{FileRegistry, SampleKey};
use crate::spe::{SpePacket, EVENT_BRANCH_MISS};

/// Branch statistics for one `(file, offset)` location. All samples for a
/// location describe the same instruction, so `branch_type` is simply the
/// last observed value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BranchStats {
    pub count: u64,
    pub mispredicted: u64,
    pub branch_type: u8,
}

impl BranchStats {
    pub fn from_packet(packet: &SpePacket) -> BranchStats {
        BranchStats {
            count: 1,
            mispredicted: if packet.events & EVENT_BRANCH_MISS != 0 {
                1
            } else {
                0
            },
            branch_type: packet.branch_type,
        }
    }

    fn merge(&mut self, other: &BranchStats) {
        self.count += other.count;
        self.mispredicted += other.mispredicted;
        self.branch_type = other.branch_type;
    }
}

#[derive(Debug, Default)]
pub struct BranchMissMap {
    entries: BTreeMap<SampleKey, BranchStats>,
}

impl BranchMissMap {
    pub fn new() -> BranchMissMap {
        BranchMissMap::default()
    }

    pub fn record(&mut self, key: SampleKey, stats: &BranchStats) {
        self.entries.entry(key).or_default().merge(stats);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SampleKey) -> Option<&BranchStats> {
        self.entries.get(key)
    }

    pub fn write_csv<W: Write>(&self, mut out: W, files: &FileRegistry) -> io::Result<()> {
        writeln!(out, "filename,offset,count,mispredicted,branch_type")?;

        for (key, stats) in &self.entries {
            let Some(filename) = files.path_of(&key.file_id) else {
                warn!(
                    "no filename registered for inode {} ({}:{}); dropping branch entry",
                    key.file_id.inode, key.file_id.major, key.file_id.minor
                );
                continue;
            };

            writeln!(
                out,
                "{},0x{:x},{},{},0x{:x}",
                filename, key.offset, stats.count, stats.mispredicted, stats.branch_type
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_registry::FileId;
    use crate::spe::{BRANCH_KIND_CONDITIONAL, EVENT_BRANCH_NOT_TAKEN, PACKET_TYPE_BRANCH};

    fn branch_packet(events: u32, branch_type: u8) -> SpePacket {
        SpePacket {
            pc: 0x400500,
            kind: PACKET_TYPE_BRANCH,
            branch_type,
            events,
            issue_lat: 0,
            total_lat: 0,
            translation_lat: 0,
            virtual_address: 0,
            data_source: 0,
            timestamp: 0,
        }
    }

    fn key(inode: u64, offset: u64) -> SampleKey {
        SampleKey {
            file_id: FileId {
                major: 8,
                minor: 1,
                inode,
                generation: 0,
            },
            offset,
        }
    }

    #[test]
    fn miss_bit_drives_mispredicted() {
        let miss = BranchStats::from_packet(&branch_packet(
            EVENT_BRANCH_MISS,
            BRANCH_KIND_CONDITIONAL,
        ));
        assert_eq!(miss.count, 1);
        assert_eq!(miss.mispredicted, 1);
        assert_eq!(miss.branch_type, BRANCH_KIND_CONDITIONAL);

        // Not-taken alone is not a misprediction.
        let not_taken = BranchStats::from_packet(&branch_packet(EVENT_BRANCH_NOT_TAKEN, 0));
        assert_eq!(not_taken.mispredicted, 0);
    }

    #[test]
    fn repeated_location_accumulates() {
        let mut map = BranchMissMap::new();
        let location = key(42, 0x500);

        map.record(
            location,
            &BranchStats::from_packet(&branch_packet(
                EVENT_BRANCH_MISS,
                BRANCH_KIND_CONDITIONAL,
            )),
        );
        map.record(
            location,
            &BranchStats::from_packet(&branch_packet(0, BRANCH_KIND_CONDITIONAL)),
        );

        let stats = map.get(&location).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.mispredicted, 1);
        assert_eq!(stats.branch_type, BRANCH_KIND_CONDITIONAL);
    }

    #[test]
    fn distinct_offsets_stay_separate() {
        let mut map = BranchMissMap::new();
        map.record(
            key(42, 0x500),
            &BranchStats::from_packet(&branch_packet(EVENT_BRANCH_MISS, 1)),
        );
        map.record(key(42, 0x504), &BranchStats::from_packet(&branch_packet(0, 1)));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&key(42, 0x500)).unwrap().mispredicted, 1);
        assert_eq!(map.get(&key(42, 0x504)).unwrap().mispredicted, 0);
    }

    #[test]
    fn csv_rows_in_key_order() {
        let mut files = FileRegistry::new();
        files.register(key(42, 0).file_id, "/usr/bin/cat");

        let mut map = BranchMissMap::new();
        map.record(
            key(42, 0x504),
            &BranchStats::from_packet(&branch_packet(0, 1)),
        );
        map.record(
            key(42, 0x500),
            &BranchStats::from_packet(&branch_packet(EVENT_BRANCH_MISS, 1)),
        );

        let mut out = Vec::new();
        map.write_csv(&mut out, &files).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "filename,offset,count,mispredicted,branch_type",
                "/usr/bin/cat,0x500,1,1,0x1",
                "/usr/bin/cat,0x504,1,0,0x1",
            ]
        );
    }
}
