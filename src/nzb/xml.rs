use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::CoreError;

use super::model::{NzbFile, NzbMeta, Segment};

/// Parse an NZB document into its file list and head metadata.
///
/// Unknown elements/attributes are ignored rather than rejected — NZB
/// producers routinely add vendor extensions (spec §4.8 step 1: "parse
/// tolerantly").
pub fn parse_nzb(xml: &[u8]) -> Result<(Vec<NzbFile>, NzbMeta), CoreError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut files = Vec::new();
    let mut meta = NzbMeta::default();

    let mut buf = Vec::new();
    let mut in_head = false;
    let mut meta_key: Option<String> = None;

    let mut current_file: Option<NzbFile> = None;
    let mut in_groups = false;
    let mut in_segments = false;
    let mut pending_segment: Option<(u32, u64)> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CoreError::NzbMalformed(e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "head" => in_head = true,
                    "meta" if in_head => {
                        meta_key = attr(&e, "type");
                    }
                    "file" => {
                        let poster = attr(&e, "poster").unwrap_or_default();
                        let subject = attr(&e, "subject").unwrap_or_default();
                        let date = attr(&e, "date")
                            .and_then(|s| s.parse::<i64>().ok())
                            .unwrap_or(0);
                        current_file = Some(NzbFile {
                            subject,
                            poster,
                            date,
                            groups: Vec::new(),
                            segments: Vec::new(),
                        });
                    }
                    "groups" => in_groups = true,
                    "segments" => in_segments = true,
                    "segment" if in_segments => {
                        let number = attr(&e, "number")
                            .and_then(|s| s.parse::<u32>().ok())
                            .ok_or_else(|| {
                                CoreError::NzbMalformed("segment missing number=".into())
                            })?;
                        let bytes = attr(&e, "bytes")
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(0);
                        pending_segment = Some((number, bytes));
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| CoreError::NzbMalformed(e.to_string()))?
                    .into_owned();
                if in_head {
                    if let Some(key) = meta_key.take() {
                        meta.0.insert(key, text);
                    }
                } else if in_groups {
                    if let Some(file) = current_file.as_mut() {
                        file.groups.push(text);
                    }
                } else if let Some((number, bytes)) = pending_segment.take() {
                    if let Some(file) = current_file.as_mut() {
                        let message_id = text.trim_start_matches('<').trim_end_matches('>').to_string();
                        file.segments.push(Segment {
                            message_id,
                            number,
                            declared_bytes: bytes,
                        });
                    }
                }
            }
            Event::End(e) => match local_name(&e).as_str() {
                "head" => in_head = false,
                "groups" => in_groups = false,
                "segments" => in_segments = false,
                "file" => {
                    if let Some(file) = current_file.take() {
                        files.push(file);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if files.is_empty() {
        return Err(CoreError::NzbMalformed("no <file> entries found".into()));
    }

    Ok((files, meta))
}

fn local_name(e: &quick_xml::events::BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attr(e: &quick_xml::events::BytesStart, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == key.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="name">Example.Release-GROUP</meta>
    <meta type="password">hunter2</meta>
  </head>
  <file poster="poster@example.com" date="1700000000" subject="[1/2] example.mkv (1/3)">
    <groups>
      <group>alt.binaries.example</group>
    </groups>
    <segments>
      <segment bytes="716800" number="2">part2message@example</segment>
      <segment bytes="716800" number="1">part1message@example</segment>
    </segments>
  </file>
</nzb>"#;

    #[test]
    fn parses_files_segments_and_meta() {
        let (files, meta) = parse_nzb(SAMPLE.as_bytes()).unwrap();
        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.poster, "poster@example.com");
        assert_eq!(file.groups, vec!["alt.binaries.example".to_string()]);
        assert_eq!(file.segments.len(), 2);
        assert_eq!(meta.get("name"), Some("Example.Release-GROUP"));
        assert_eq!(meta.get("password"), Some("hunter2"));
    }

    #[test]
    fn segments_in_order_sorts_by_number_regardless_of_xml_order() {
        let (files, _) = parse_nzb(SAMPLE.as_bytes()).unwrap();
        let ordered = files[0].segments_in_order();
        assert_eq!(ordered[0].number, 1);
        assert_eq!(ordered[1].number, 2);
        assert_eq!(ordered[0].message_id, "part1message@example");
    }

    #[test]
    fn rejects_document_with_no_files() {
        let xml = r#"<nzb><head></head></nzb>"#;
        assert!(parse_nzb(xml.as_bytes()).is_err());
    }
}
