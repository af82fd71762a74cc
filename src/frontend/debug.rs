//! Debug taps
//!
//! Every input pin of every instance in the top definition's hierarchy is a
//! tap. The instrumented `<top>_capture_values` pass stores each tap's value
//! into one member of a debug record; records are looked up by instance path
//! and pin name, and grouped by the definition that contains the instance.

use std::collections::HashMap;

use crate::abi::{AbiStruct, LayoutRules};
use crate::builder::FlatGraph;
use crate::circuit::DefId;
use crate::error::Result;

/// One captured signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapRecord {
    /// Instance names from the top definition.
    pub path: Vec<String>,
    pub pin: String,
    pub width: u32,
    /// Definition containing the tapped instance.
    pub definition: DefId,
    /// Bit offset of the captured value in the debug region.
    pub bit_offset: u64,
}

impl TapRecord {
    /// `path.to.instance.pin`
    pub fn name(&self) -> String {
        tap_key(self.path.iter().map(String::as_str), &self.pin)
    }
}

fn tap_key<'a>(path: impl IntoIterator<Item = &'a str>, pin: &str) -> String {
    let mut key = String::new();
    for part in path {
        key.push_str(part);
        key.push('.');
    }
    key.push_str(pin);
    key
}

/// Tap records and the capture region they are stored in
#[derive(Debug, Clone)]
pub struct DebugInfo {
    records: Vec<TapRecord>,
    by_definition: HashMap<DefId, Vec<usize>>,
    index: HashMap<String, usize>,
    region: AbiStruct,
    cursor: usize,
}

impl DebugInfo {
    pub fn new(graph: &FlatGraph, rules: LayoutRules) -> Result<Self> {
        let members: Vec<(String, u32)> = graph
            .taps
            .iter()
            .map(|t| (tap_key(t.path.iter().map(String::as_str), &t.pin), t.width))
            .collect();
        let region = AbiStruct::with_members(&members, rules)?;

        let mut records = Vec::with_capacity(graph.taps.len());
        let mut by_definition: HashMap<DefId, Vec<usize>> = HashMap::new();
        let mut index = HashMap::with_capacity(graph.taps.len());
        for (i, (tap, member)) in graph.taps.iter().zip(region.layout().members()).enumerate() {
            by_definition.entry(tap.definition).or_default().push(i);
            index.insert(member.name.clone(), i);
            records.push(TapRecord {
                path: tap.path.clone(),
                pin: tap.pin.clone(),
                width: tap.width,
                definition: tap.definition,
                bit_offset: member.bit_offset,
            });
        }

        let cursor = region.layout().size();
        Ok(Self {
            records,
            by_definition,
            index,
            region,
            cursor,
        })
    }

    pub fn records(&self) -> &[TapRecord] {
        &self.records
    }

    /// Taps on instances directly inside `definition`, in capture order.
    pub fn records_for(&self, definition: DefId) -> impl Iterator<Item = &TapRecord> {
        self.by_definition
            .get(&definition)
            .into_iter()
            .flatten()
            .map(|i| &self.records[*i])
    }

    pub fn find(&self, path: &[&str], pin: &str) -> Option<usize> {
        self.index.get(&tap_key(path.iter().copied(), pin)).copied()
    }

    pub fn region(&self) -> &AbiStruct {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut AbiStruct {
        &mut self.region
    }

    /// Bytes of the capture region in use.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
