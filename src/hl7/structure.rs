//! Static HL7 v2.5.1 message structure definitions.
//!
//! Only the structures the hub renders are defined: `ORU_R01` for results and
//! `ACK` for acknowledgments.

/// A child of a group: either a segment or a nested group.
#[derive(Debug, Clone, Copy)]
pub enum StructureElement {
    Segment(SegmentRef),
    Group(&'static GroupDef),
}

impl StructureElement {
    pub fn name(&self) -> &'static str {
        match self {
            StructureElement::Segment(s) => s.name,
            StructureElement::Group(g) => g.name,
        }
    }

    pub fn repeating(&self) -> bool {
        match self {
            StructureElement::Segment(s) => s.repeating,
            StructureElement::Group(g) => g.repeating,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentRef {
    pub name: &'static str,
    pub repeating: bool,
}

#[derive(Debug)]
pub struct GroupDef {
    pub name: &'static str,
    pub repeating: bool,
    pub children: &'static [StructureElement],
}

/// A complete message structure.
#[derive(Debug)]
pub struct MessageStructure {
    pub name: &'static str,
    pub message_code: &'static str,
    pub trigger_event: &'static str,
    pub children: &'static [StructureElement],
}

impl MessageStructure {
    /// Look up a structure by its name (`ORU_R01`, `ACK`).
    pub fn by_name(name: &str) -> Option<&'static MessageStructure> {
        STRUCTURES.iter().copied().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// MSH-9 value for messages of this structure.
    pub fn msh9(&self) -> String {
        format!("{}^{}^{}", self.message_code, self.trigger_event, self.name)
    }
}

const fn seg(name: &'static str, repeating: bool) -> StructureElement {
    StructureElement::Segment(SegmentRef { name, repeating })
}

static ORU_R01_VISIT: GroupDef = GroupDef {
    name: "VISIT",
    repeating: false,
    children: &[seg("PV1", false), seg("PV2", false)],
};

static ORU_R01_PATIENT: GroupDef = GroupDef {
    name: "PATIENT",
    repeating: false,
    children: &[
        seg("PID", false),
        seg("PD1", false),
        seg("NTE", true),
        seg("NK1", true),
        StructureElement::Group(&ORU_R01_VISIT),
    ],
};

static ORU_R01_TIMING_QTY: GroupDef = GroupDef {
    name: "TIMING_QTY",
    repeating: true,
    children: &[seg("TQ1", false), seg("TQ2", true)],
};

static ORU_R01_OBSERVATION: GroupDef = GroupDef {
    name: "OBSERVATION",
    repeating: true,
    children: &[seg("OBX", false), seg("NTE", true)],
};

static ORU_R01_SPECIMEN: GroupDef = GroupDef {
    name: "SPECIMEN",
    repeating: true,
    children: &[seg("SPM", false), seg("OBX", true)],
};

static ORU_R01_ORDER_OBSERVATION: GroupDef = GroupDef {
    name: "ORDER_OBSERVATION",
    repeating: true,
    children: &[
        seg("ORC", false),
        seg("OBR", false),
        seg("NTE", true),
        StructureElement::Group(&ORU_R01_TIMING_QTY),
        seg("CTD", false),
        StructureElement::Group(&ORU_R01_OBSERVATION),
        seg("FT1", true),
        seg("CTI", true),
        StructureElement::Group(&ORU_R01_SPECIMEN),
    ],
};

static ORU_R01_PATIENT_RESULT: GroupDef = GroupDef {
    name: "PATIENT_RESULT",
    repeating: true,
    children: &[
        StructureElement::Group(&ORU_R01_PATIENT),
        StructureElement::Group(&ORU_R01_ORDER_OBSERVATION),
    ],
};

pub static ORU_R01: MessageStructure = MessageStructure {
    name: "ORU_R01",
    message_code: "ORU",
    trigger_event: "R01",
    children: &[
        seg("MSH", false),
        seg("SFT", true),
        StructureElement::Group(&ORU_R01_PATIENT_RESULT),
        seg("DSC", false),
    ],
};

pub static ACK: MessageStructure = MessageStructure {
    name: "ACK",
    message_code: "ACK",
    trigger_event: "",
    children: &[
        seg("MSH", false),
        seg("SFT", true),
        seg("MSA", false),
        seg("ERR", true),
    ],
};

static STRUCTURES: &[&MessageStructure] = &[&ORU_R01, &ACK];

/// Number of fields defined for a segment in v2.5.1.
pub fn max_fields(segment: &str) -> Option<usize> {
    let count = match segment {
        "MSH" => 21,
        "SFT" => 6,
        "PID" => 39,
        "PD1" => 21,
        "NTE" => 4,
        "NK1" => 39,
        "PV1" => 52,
        "PV2" => 49,
        "ORC" => 31,
        "OBR" => 50,
        "TQ1" => 14,
        "TQ2" => 10,
        "CTD" => 7,
        "OBX" => 25,
        "FT1" => 55,
        "CTI" => 3,
        "SPM" => 30,
        "DSC" => 2,
        "MSA" => 6,
        "ERR" => 12,
        _ => return None,
    };
    Some(count)
}

/// Find the first group route to a segment, depth first. Returns the child
/// indices of the groups to descend through and the segment's own index.
pub fn find_segment(
    children: &'static [StructureElement],
    segment: &str,
) -> Option<(Vec<usize>, usize)> {
    for (index, child) in children.iter().enumerate() {
        match child {
            StructureElement::Segment(s) if s.name == segment => {
                return Some((Vec::new(), index));
            }
            StructureElement::Group(group) => {
                if let Some((mut route, found)) = find_segment(group.children, segment) {
                    route.insert(0, index);
                    return Some((route, found));
                }
            }
            StructureElement::Segment(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_structure() {
        let oru = MessageStructure::by_name("oru_r01").unwrap();
        assert_eq!(oru.msh9(), "ORU^R01^ORU_R01");
        assert!(MessageStructure::by_name("ADT_A01").is_none());
    }

    #[test]
    fn test_find_segment_depth_first() {
        let (route, index) = find_segment(ORU_R01.children, "OBX").unwrap();
        // PATIENT_RESULT -> ORDER_OBSERVATION -> OBSERVATION -> OBX
        assert_eq!(route, vec![2, 1, 5]);
        assert_eq!(index, 0);

        let (route, _) = find_segment(ORU_R01.children, "PID").unwrap();
        assert_eq!(route, vec![2, 0]);

        assert!(find_segment(ORU_R01.children, "ZZZ").is_none());
    }
}
