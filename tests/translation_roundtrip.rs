//! Round trips through the shipped ORU^R01 templates.

use std::path::PathBuf;
use std::sync::Arc;

use reportwire::fhirpath::Document;
use reportwire::hl7::Hl7Message;
use reportwire::{Bundle, TemplateStore, Translator};
use serde_json::json;

fn translator() -> Translator {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");
    Translator::new(Arc::new(TemplateStore::new(dir)))
}

fn lab_bundle() -> Bundle {
    Bundle::from_value(json!({
        "resourceType": "Bundle",
        "type": "message",
        "identifier": {"value": "MSG-1001"},
        "timestamp": "2024-03-01T10:15:00-05:00",
        "entry": [
            {
                "fullUrl": "MessageHeader/header",
                "resource": {
                    "resourceType": "MessageHeader",
                    "id": "header",
                    "eventCoding": {"code": "R01"},
                    "source": {"name": "LAB"},
                    "sender": {"display": "FAC"},
                    "destination": [{"name": "HUB", "receiver": {"display": "CDC"}}]
                }
            },
            {
                "fullUrl": "Patient/patient",
                "resource": {
                    "resourceType": "Patient",
                    "id": "patient",
                    "identifier": [{"value": "MRN-1"}],
                    "name": [{"family": "Doe", "given": ["Jane"]}],
                    "birthDate": "1980-04-02",
                    "gender": "female",
                    "address": [{"state": "CO"}]
                }
            },
            {
                "resource": {
                    "resourceType": "DiagnosticReport",
                    "id": "report",
                    "code": {"coding": [{"code": "94500-6", "display": "SARS-CoV-2 RNA"}]}
                }
            },
            {
                "resource": {
                    "resourceType": "Observation",
                    "id": "obs-1",
                    "status": "final",
                    "code": {"coding": [{
                        "system": "http://loinc.org",
                        "code": "94500-6",
                        "display": "SARS-CoV-2 RNA"
                    }]},
                    "valueCodeableConcept": {"coding": [{"code": "260373001", "display": "Detected"}]},
                    "effectiveDateTime": "2024-03-01T09:00:00-05:00"
                }
            },
            {
                "resource": {
                    "resourceType": "Observation",
                    "id": "obs-2",
                    "status": "final",
                    "code": {"coding": [{"system": "http://loinc.org", "code": "95209-3"}]},
                    "valueCodeableConcept": {"coding": [{"code": "260415000", "display": "Not detected"}]}
                }
            }
        ]
    }))
    .unwrap()
}

const ORU: &str = "MSH|^~\\&|LAB^1.2.3^ISO|FAC|HUB|CDC|20240301101500-0500||ORU^R01^ORU_R01|CTRL-1|P|2.5.1|||AL|NE\r\
PID|1||MRN-7||Roe^Rick||19700101|M|||^^^TX\r\
OBR|1|||94500-6^SARS-CoV-2 RNA^LN\r\
OBX|1|CWE|94500-6^SARS-CoV-2 RNA^LN||260373001^Detected||||||F|||20240301090000-0500";

#[test]
fn test_fhir_to_hl7() {
    let message = translator()
        .fhir_to_hl7(&lab_bundle(), "fhir-to-oru-r01")
        .unwrap();

    assert_eq!(message.get("MSH-10"), Some("MSG-1001"));
    assert_eq!(message.get("MSH-7"), Some("20240301101500-0500"));
    assert_eq!(message.get("MSH-3"), Some("LAB"));
    assert_eq!(message.get("MSH-9-2"), Some("R01"));
    assert_eq!(message.get("PID-3"), Some("MRN-1"));
    assert_eq!(message.get("PID-5-1"), Some("Doe"));
    assert_eq!(message.get("PID-5-2"), Some("Jane"));
    assert_eq!(message.get("PID-7"), Some("19800402"));
    assert_eq!(message.get("PID-8"), Some("F"));
    assert_eq!(message.get("PID-11-4"), Some("CO"));
    assert_eq!(message.get("OBR-4-1"), Some("94500-6"));

    let obx = |n: usize, field: &str| {
        message
            .get(&format!("/PATIENT_RESULT/ORDER_OBSERVATION/OBSERVATION({n})/OBX-{field}"))
            .map(str::to_string)
    };
    assert_eq!(obx(0, "3-3").as_deref(), Some("LN"));
    assert_eq!(obx(0, "5-2").as_deref(), Some("Detected"));
    assert_eq!(obx(0, "11").as_deref(), Some("F"));
    assert_eq!(obx(0, "14").as_deref(), Some("20240301090000-0500"));
    assert_eq!(obx(1, "5-1").as_deref(), Some("260415000"));
    assert_eq!(obx(1, "14"), None);

    let names: Vec<String> = message
        .segments()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    assert_eq!(names, ["MSH", "PID", "OBR", "OBX", "OBX"]);
}

#[test]
fn test_fhir_round_trip() {
    let translator = translator();
    let message = translator
        .fhir_to_hl7(&lab_bundle(), "fhir-to-oru-r01")
        .unwrap();
    let back = translator
        .hl7_text_to_fhir(&message.encode(), "oru-r01-to-fhir")
        .unwrap();

    let root = back.as_value();
    assert_eq!(root["identifier"]["value"], "MSG-1001");
    assert_eq!(root["timestamp"], "2024-03-01T10:15:00-05:00");

    let patient = back.resolve("Patient/patient").unwrap();
    assert_eq!(patient["name"][0]["family"], "Doe");
    assert_eq!(patient["name"][0]["given"][0], "Jane");
    assert_eq!(patient["birthDate"], "1980-04-02");
    assert_eq!(patient["gender"], "female");
    assert_eq!(patient["address"][0]["state"], "CO");

    let first = back.resolve("Observation/obx-0").unwrap();
    assert_eq!(first["code"]["coding"][0]["system"], "http://loinc.org");
    assert_eq!(first["status"], "final");
    assert_eq!(first["effectiveDateTime"], "2024-03-01T09:00:00-05:00");
    assert_eq!(first["subject"]["reference"], "Patient/patient");

    let second = back.resolve("Observation/obx-1").unwrap();
    assert_eq!(second["valueCodeableConcept"]["coding"][0]["code"], "260415000");
    assert!(second.get("effectiveDateTime").is_none());

    let header = back.resolve("MessageHeader/header").unwrap();
    assert_eq!(header["eventCoding"]["code"], "R01");
    assert_eq!(header["destination"][0]["receiver"]["display"], "CDC");
}

#[test]
fn test_hl7_round_trip() {
    let translator = translator();
    let bundle = translator.hl7_text_to_fhir(ORU, "oru-r01-to-fhir").unwrap();
    let message = translator.fhir_to_hl7(&bundle, "fhir-to-oru-r01").unwrap();
    let original = Hl7Message::parse(ORU).unwrap();

    for path in [
        "MSH-3", "MSH-4", "MSH-5", "MSH-6", "MSH-7", "MSH-10", "PID-3", "PID-5-1", "PID-5-2",
        "PID-7", "PID-8", "PID-11-4", "OBR-4-1", "OBR-4-2", "OBX-3-1", "OBX-3-3", "OBX-5-1",
        "OBX-11", "OBX-14",
    ] {
        assert_eq!(message.get(path), original.get(path), "{path} differs");
    }
}

#[test]
fn test_unknown_schema() {
    let err = translator()
        .fhir_to_hl7(&lab_bundle(), "no-such-schema")
        .unwrap_err();
    assert!(err.to_string().contains("no-such-schema"), "{err}");
}

fn with_birth_date(birth_date: &str) -> Bundle {
    let mut value = lab_bundle().as_value().clone();
    value["entry"][1]["resource"]["birthDate"] = json!(birth_date);
    Bundle::from_value(value).unwrap()
}

#[test]
fn test_partial_birth_dates_are_not_padded() {
    let translator = translator();
    for (birth_date, pid_7) in [("1980", "1980"), ("1980-04", "198004"), ("1980-04-02", "19800402")] {
        let message = translator
            .fhir_to_hl7(&with_birth_date(birth_date), "fhir-to-oru-r01")
            .unwrap();
        assert_eq!(message.get("PID-7"), Some(pid_7), "{birth_date}");

        let back = translator
            .hl7_text_to_fhir(&message.encode(), "oru-r01-to-fhir")
            .unwrap();
        let patient = back.resolve("Patient/patient").unwrap();
        assert_eq!(patient["birthDate"], birth_date);
    }
}

#[test]
fn test_day_precision_hl7_times_stay_dates() {
    let oru = ORU
        .replace("19700101", "197004")
        .replace("20240301090000-0500", "20240301");
    let bundle = translator()
        .hl7_text_to_fhir(&oru, "oru-r01-to-fhir")
        .unwrap();

    let patient = bundle.resolve("Patient/patient").unwrap();
    assert_eq!(patient["birthDate"], "1970-04");
    let observation = bundle.resolve("Observation/obx-0").unwrap();
    assert_eq!(observation["effectiveDateTime"], "2024-03-01");

    let message = translator().fhir_to_hl7(&bundle, "fhir-to-oru-r01").unwrap();
    assert_eq!(message.get("PID-7"), Some("197004"));
    assert_eq!(message.get("OBX-14"), Some("20240301"));
}
