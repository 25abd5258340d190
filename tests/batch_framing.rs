use chrono::{FixedOffset, TimeZone};
use reportwire::hl7::{join, split, BatchHeader, FramingError, Hl7Message};

fn message(control: &str) -> String {
    format!(
        "MSH|^~\\&|LAB|FAC|HUB|CDC|20240301101500-0500||ORU^R01^ORU_R01|{control}|P|2.5.1\r\
         PID|1||{control}-MRN\r\
         OBX|1|ST|||value-{control}"
    )
}

fn header() -> BatchHeader {
    BatchHeader {
        sending_application: "LAB".to_string(),
        sending_facility: "FAC".to_string(),
        receiving_application: "HUB".to_string(),
        receiving_facility: "CDC".to_string(),
        created: FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 10, 15, 0)
            .unwrap(),
    }
}

fn batch(count: usize) -> String {
    let messages: Vec<String> = (0..count).map(|i| message(&format!("M{i}"))).collect();
    join(&messages, &header())
}

fn control_ids(blob: &str) -> Vec<String> {
    Hl7Message::parse_all(blob)
        .unwrap()
        .iter()
        .map(|m| m.control_id().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_join_frames_messages() {
    let blob = batch(3);
    let lines: Vec<&str> = blob.split('\r').collect();

    assert_eq!(lines[0], "FHS|^~\\&|LAB|FAC|HUB|CDC|20240301101500-0500");
    assert!(lines[1].starts_with("BHS|^~\\&|LAB|"));
    assert_eq!(&lines[lines.len() - 2..], ["BTS|3", "FTS|1"]);
    assert!(Hl7Message::is_batch(&blob));
    assert_eq!(control_ids(&blob), ["M0", "M1", "M2"]);
}

#[test]
fn test_split_selects_in_requested_order() {
    let blob = batch(4);
    let picked = split(&blob, &[3, 1]).unwrap();

    assert_eq!(control_ids(&picked), ["M3", "M1"]);
    assert!(picked.starts_with("FHS|"));
    assert!(picked.ends_with("BTS|2\rFTS|1"));
}

#[test]
fn test_split_of_split_matches_direct_split() {
    let blob = batch(5);
    let once = split(&blob, &[1, 2, 4]).unwrap();
    let twice = split(&once, &[2]).unwrap();
    assert_eq!(twice, split(&blob, &[4]).unwrap());
}

#[test]
fn test_split_with_no_indices_keeps_only_the_envelope() {
    let blob = batch(2);
    let empty = split(&blob, &[]).unwrap();
    let lines: Vec<&str> = empty.split('\r').collect();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[2..], ["BTS|0", "FTS|1"]);
}

#[test]
fn test_split_errors() {
    assert_eq!(
        split(&batch(2), &[2]),
        Err(FramingError::OutOfRange { index: 2, count: 2 })
    );

    let single = message("S");
    assert_eq!(split(&single, &[0]).unwrap(), single);
    assert_eq!(
        split(&single, &[1]),
        Err(FramingError::SingleMessageIndex(vec![1]))
    );

    assert_eq!(split("", &[]).unwrap(), "");
    assert_eq!(split("  \r\n", &[0]), Err(FramingError::BlankWithIndices(vec![0])));
    assert!(matches!(split("PID|1", &[0]), Err(FramingError::UnknownLead(_))));
}

#[test]
fn test_header_from_message() {
    let parsed = Hl7Message::parse(&message("X")).unwrap();
    let from_message = BatchHeader::from_message(&parsed, header().created);
    assert_eq!(from_message, header());
}
