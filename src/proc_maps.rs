//! Parser for `/proc/<pid>/maps`, used once at startup to seed the mapping
//! directory with the processes that were already running before the
//! kernel started emitting MMAP2 records for us.

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    let mut found = None;
    for (index, ch) in p.char_indices() {
        if ch == delimiter {
            found = Some(index);
            break;
        }
    }

    if let Some(index) = found {
        let (before, after) = p.split_at(index);
        *p = &after[delimiter.len_utf8()..];
        before
    } else {
        let before = *p;
        *p = "";
        before
    }
}

fn skip_whitespace(p: &mut &str) {
    while let Some(ch) = p.chars().next() {
        if ch == ' ' {
            *p = &p[ch.len_utf8()..];
        } else {
            break;
        }
    }
}

fn parse_line(mut line: &str) -> Option<Region> {
    let start = u64::from_str_radix(get_until(&mut line, '-'), 16).ok()?;
    let end = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _perms = get_until(&mut line, ' ');
    let file_offset = u64::from_str_radix(get_until(&mut line, ' '), 16).ok()?;
    let _device = get_until(&mut line, ' ');
    let _inode = get_until(&mut line, ' ');
    skip_whitespace(&mut line);
    let path = line.to_owned();

    Some(Region {
        start,
        end,
        file_offset,
        path,
    })
}

/// Malformed lines are dropped rather than failing the whole bootstrap;
/// `/proc` contents can shift underneath us while we read them.
pub fn parse(maps: &str) -> Vec<Region> {
    if maps.is_empty() {
        return Vec::new();
    }

    maps.trim().split('\n').filter_map(parse_line).collect()
}

#[test]
fn test_get_until() {
    let mut p = "1234 5678";
    assert_eq!(get_until(&mut p, ' '), "1234");
    assert_eq!(p, "5678");

    assert_eq!(get_until(&mut p, ' '), "5678");
    assert_eq!(p, "");

    assert_eq!(get_until(&mut p, ' '), "");
}

#[test]
fn test_parse() {
    let maps = r#"
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289                    /usr/lib/locale/locale-archive
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
"#;

    assert_eq!(
        parse(maps),
        vec![
            Region {
                start: 0x00400000,
                end: 0x0040c000,
                file_offset: 0,
                path: "/usr/bin/cat".to_owned()
            },
            Region {
                start: 0x0060d000,
                end: 0x0062e000,
                file_offset: 0,
                path: "[heap]".to_owned()
            },
            Region {
                start: 0x7ffff672c000,
                end: 0x7ffff69db000,
                file_offset: 0x1ac2,
                path: "/usr/lib/locale/locale-archive".to_owned()
            },
            Region {
                start: 0x7ffff5600000,
                end: 0x7ffff5800000,
                file_offset: 0,
                path: "".to_owned()
            }
        ]
    );
}

#[test]
fn test_empty_maps() {
    assert_eq!(parse(""), vec![]);
}

#[test]
fn test_malformed_line_is_skipped() {
    let maps = "not a mapping line\n00400000-00401000 r-xp 00000000 08:02 99 /bin/true";
    let regions = parse(maps);
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].path, "/bin/true");
}
