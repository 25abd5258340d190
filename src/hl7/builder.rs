//! Structured HL7 message building.
//!
//! A [`StructuredMessageBuilder`] starts from an empty message of a declared
//! structure and applies mappings one at a time. `apply` consumes the builder,
//! so a failed mapping drops the partially built message with it; the only way
//! to obtain a [`StructuredMessage`] is [`StructuredMessageBuilder::finish`].

use tracing::debug;

use super::path::TerserPath;
use super::segment::{Delimiters, Segment};
use super::structure::{find_segment, max_fields, MessageStructure, StructureElement};
use super::{Hl7Message, HL7_VERSION};
use crate::error::{AddressError, BuildError};
use crate::mapping::Mapping;

#[derive(Debug, Clone)]
enum Node {
    Segment(Segment),
    Group(GroupNode),
}

/// Instances of one group; `slots[i]` holds the repetitions of `children[i]`.
#[derive(Debug, Clone)]
struct GroupNode {
    children: &'static [StructureElement],
    slots: Vec<Vec<Node>>,
}

impl GroupNode {
    fn new(children: &'static [StructureElement]) -> Self {
        Self {
            children,
            slots: vec![Vec::new(); children.len()],
        }
    }

    fn collect_segments<'a>(&'a self, out: &mut Vec<&'a Segment>) {
        for slot in &self.slots {
            for node in slot {
                match node {
                    Node::Segment(segment) => out.push(segment),
                    Node::Group(group) => group.collect_segments(out),
                }
            }
        }
    }
}

/// A resolved location: the group steps to descend, then the segment slot.
#[derive(Debug)]
struct Route {
    groups: Vec<(usize, usize)>,
    segment: (usize, usize),
}

/// A fully built HL7 message with its group structure.
#[derive(Debug, Clone)]
pub struct StructuredMessage {
    structure: &'static MessageStructure,
    delimiters: Delimiters,
    root: GroupNode,
}

impl StructuredMessage {
    /// Build a message from mappings, failing on the first bad field path.
    pub fn build(
        structure: &'static MessageStructure,
        mappings: &[Mapping],
    ) -> Result<Self, BuildError> {
        mappings
            .iter()
            .try_fold(StructuredMessageBuilder::new(structure), |builder, mapping| {
                builder.apply(mapping)
            })
            .map(StructuredMessageBuilder::finish)
    }

    pub fn structure(&self) -> &'static MessageStructure {
        self.structure
    }

    /// Segments in wire order.
    pub fn segments(&self) -> Vec<&Segment> {
        let mut out = Vec::new();
        self.root.collect_segments(&mut out);
        out
    }

    /// Read a value by terser path without creating anything.
    pub fn get(&self, path: &str) -> Option<&str> {
        let path = TerserPath::parse(path).ok()?;
        let route = resolve_route(self.structure, &path).ok()?;
        let mut group = &self.root;
        for (child, rep) in &route.groups {
            match group.slots.get(*child)?.get(*rep)? {
                Node::Group(next) => group = next,
                Node::Segment(_) => return None,
            }
        }
        let (child, rep) = route.segment;
        match group.slots.get(child)?.get(rep)? {
            Node::Segment(segment) => segment.value(
                path.field,
                path.field_repetition,
                path.component,
                path.subcomponent,
            ),
            Node::Group(_) => None,
        }
    }

    /// Encode as ER7, segments separated by carriage returns.
    pub fn encode(&self) -> String {
        self.segments()
            .iter()
            .map(|s| s.encode(&self.delimiters))
            .collect::<Vec<_>>()
            .join("\r")
    }

    /// Flatten into an [`Hl7Message`].
    pub fn to_message(&self) -> Hl7Message {
        Hl7Message::from_segments(
            self.delimiters,
            self.segments().into_iter().cloned().collect(),
        )
    }
}

/// Incremental builder for [`StructuredMessage`].
#[derive(Debug)]
pub struct StructuredMessageBuilder {
    message: StructuredMessage,
}

impl StructuredMessageBuilder {
    /// Start a message with MSH-1, MSH-2, MSH-9 and MSH-12 populated.
    pub fn new(structure: &'static MessageStructure) -> Self {
        let delimiters = Delimiters::default();
        let mut msh = Segment::new("MSH");
        msh.set_value(1, 0, 1, 1, delimiters.field.to_string());
        msh.set_value(2, 0, 1, 1, delimiters.encoding_characters());
        msh.set_value(9, 0, 1, 1, structure.message_code);
        if !structure.trigger_event.is_empty() {
            msh.set_value(9, 0, 2, 1, structure.trigger_event);
            msh.set_value(9, 0, 3, 1, structure.name);
        }
        msh.set_value(12, 0, 1, 1, HL7_VERSION);

        let mut root = GroupNode::new(structure.children);
        if let Some(index) = structure.children.iter().position(|c| c.name() == "MSH") {
            root.slots[index].push(Node::Segment(msh));
        }

        Self {
            message: StructuredMessage {
                structure,
                delimiters,
                root,
            },
        }
    }

    /// Apply one mapping. On failure the builder is consumed and the error
    /// carries the field path and the value that could not be set.
    pub fn apply(self, mapping: &Mapping) -> Result<Self, BuildError> {
        self.set(&mapping.destination_field, &mapping.value)
    }

    /// Set a value at a terser path.
    pub fn set(mut self, field: &str, value: &str) -> Result<Self, BuildError> {
        let wrap = |source: AddressError| BuildError {
            field: field.to_string(),
            value: value.to_string(),
            source,
        };

        let path = TerserPath::parse(field).map_err(wrap)?;
        let route = resolve_route(self.message.structure, &path).map_err(wrap)?;
        validate_field(&path).map_err(wrap)?;

        if value.is_empty() {
            // An empty value never materializes segments, but the path is still checked.
            return Ok(self);
        }

        let segment = self.message.root.segment_mut(&route, &path.segment);
        segment.set_value(
            path.field,
            path.field_repetition,
            path.component,
            path.subcomponent,
            value,
        );
        debug!(field, value, "set HL7 field");
        Ok(self)
    }

    /// Finalize the message.
    pub fn finish(self) -> StructuredMessage {
        self.message
    }
}

impl GroupNode {
    fn segment_mut(&mut self, route: &Route, name: &str) -> &mut Segment {
        let mut group = self;
        for (child, rep) in &route.groups {
            let element = group.children[*child];
            let slot = &mut group.slots[*child];
            while slot.len() <= *rep {
                let children = match element {
                    StructureElement::Group(def) => def.children,
                    StructureElement::Segment(_) => &[],
                };
                slot.push(Node::Group(GroupNode::new(children)));
            }
            group = match &mut slot[*rep] {
                Node::Group(next) => next,
                Node::Segment(_) => unreachable!("route steps always address groups"),
            };
        }

        let (child, rep) = route.segment;
        let slot = &mut group.slots[child];
        while slot.len() <= rep {
            slot.push(Node::Segment(Segment::new(name)));
        }
        match &mut slot[rep] {
            Node::Segment(segment) => segment,
            Node::Group(_) => unreachable!("route segment always addresses a segment"),
        }
    }
}

/// Map a terser path onto the structure definition, checking every step.
fn resolve_route(
    structure: &'static MessageStructure,
    path: &TerserPath,
) -> Result<Route, AddressError> {
    if path.groups.is_empty() {
        let (group_route, segment_index) = find_segment(structure.children, &path.segment)
            .ok_or_else(|| AddressError::UnknownElement {
                name: path.segment.clone(),
                parent: structure.name.to_string(),
            })?;
        let mut children = structure.children;
        for index in &group_route {
            if let StructureElement::Group(def) = children[*index] {
                children = def.children;
            }
        }
        check_repetition(&children[segment_index], path.segment_repetition)?;
        return Ok(Route {
            groups: group_route.into_iter().map(|i| (i, 0)).collect(),
            segment: (segment_index, path.segment_repetition),
        });
    }

    let mut children = structure.children;
    let mut parent = structure.name;
    let mut groups = Vec::with_capacity(path.groups.len());
    for step in &path.groups {
        let index = children
            .iter()
            .position(|c| matches!(c, StructureElement::Group(g) if g.name == step.name))
            .ok_or_else(|| AddressError::UnknownElement {
                name: step.name.clone(),
                parent: parent.to_string(),
            })?;
        check_repetition(&children[index], step.repetition)?;
        groups.push((index, step.repetition));
        if let StructureElement::Group(def) = children[index] {
            parent = def.name;
            children = def.children;
        }
    }

    let index = children
        .iter()
        .position(|c| matches!(c, StructureElement::Segment(s) if s.name == path.segment))
        .ok_or_else(|| AddressError::UnknownElement {
            name: path.segment.clone(),
            parent: parent.to_string(),
        })?;
    check_repetition(&children[index], path.segment_repetition)?;

    Ok(Route {
        groups,
        segment: (index, path.segment_repetition),
    })
}

fn check_repetition(element: &StructureElement, repetition: usize) -> Result<(), AddressError> {
    if repetition > 0 && !element.repeating() {
        return Err(AddressError::NotRepeating {
            name: element.name().to_string(),
            repetition,
        });
    }
    Ok(())
}

fn validate_field(path: &TerserPath) -> Result<(), AddressError> {
    let max = max_fields(&path.segment).ok_or_else(|| AddressError::UnknownElement {
        name: path.segment.clone(),
        parent: "segment definitions".to_string(),
    })?;
    if path.field > max {
        return Err(AddressError::FieldOutOfRange {
            segment: path.segment.clone(),
            field: path.field,
            max,
        });
    }
    if path.segment == "MSH" && path.field <= 2 {
        return Err(AddressError::Reserved {
            field: format!("MSH-{}", path.field),
        });
    }
    Ok(())
}
