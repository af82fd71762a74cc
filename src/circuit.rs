//! Elaborated circuit graph consumed by the compiler
//!
//! A [`Circuit`] owns a flat arena of [`Definition`]s addressed by [`DefId`].
//! Definitions are plain data: ports, instances of primitives or other
//! definitions, and nets connecting their pins. Circuits are loaded from JSON
//! or assembled with the builder methods on [`Definition`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::error::{JitError, Result};

/// Generator arguments of a primitive instance (e.g. `width`, `depth`).
pub type GenArgs = BTreeMap<String, u64>;

/// Stable handle of a definition inside its [`Circuit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefId(usize);

impl DefId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Port definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortDef {
    pub name: String,
    pub width: u32,
}

/// What an instance instantiates
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InstanceKind {
    Primitive {
        primitive: String,
        #[serde(default)]
        args: GenArgs,
    },
    Definition {
        definition: String,
    },
}

/// Instance definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: InstanceKind,
}

/// Reference to a pin: `self.port` (or bare `port`) for the enclosing
/// definition's own ports, `inst.pin` for an instance pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub struct PinRef {
    pub instance: Option<String>,
    pub port: String,
}

impl PinRef {
    pub fn port(name: impl Into<String>) -> Self {
        Self { instance: None, port: name.into() }
    }

    pub fn pin(instance: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
            port: port.into(),
        }
    }
}

impl From<&str> for PinRef {
    fn from(text: &str) -> Self {
        match text.split_once('.') {
            Some(("self", port)) => PinRef::port(port),
            Some((instance, port)) => PinRef::pin(instance, port),
            None => PinRef::port(text),
        }
    }
}

impl From<String> for PinRef {
    fn from(text: String) -> Self {
        PinRef::from(text.as_str())
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}.{}", instance, self.port),
            None => write!(f, "self.{}", self.port),
        }
    }
}

/// Net: one source pin fanning out to any number of sinks
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetDef {
    pub source: PinRef,
    pub sinks: Vec<PinRef>,
}

/// A named module of the circuit
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Definition {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<PortDef>,
    #[serde(default)]
    pub outputs: Vec<PortDef>,
    #[serde(default)]
    pub instances: Vec<InstanceDef>,
    #[serde(default)]
    pub nets: Vec<NetDef>,
}

impl Definition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            instances: Vec::new(),
            nets: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, width: u32) -> Self {
        self.inputs.push(PortDef { name: name.into(), width });
        self
    }

    pub fn output(mut self, name: impl Into<String>, width: u32) -> Self {
        self.outputs.push(PortDef { name: name.into(), width });
        self
    }

    pub fn primitive(mut self, name: impl Into<String>, kind: impl Into<String>, args: &[(&str, u64)]) -> Self {
        self.instances.push(InstanceDef {
            name: name.into(),
            kind: InstanceKind::Primitive {
                primitive: kind.into(),
                args: args.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            },
        });
        self
    }

    pub fn instance(mut self, name: impl Into<String>, definition: impl Into<String>) -> Self {
        self.instances.push(InstanceDef {
            name: name.into(),
            kind: InstanceKind::Definition { definition: definition.into() },
        });
        self
    }

    pub fn net(mut self, source: &str, sinks: &[&str]) -> Self {
        self.nets.push(NetDef {
            source: PinRef::from(source),
            sinks: sinks.iter().map(|s| PinRef::from(*s)).collect(),
        });
        self
    }

    pub fn input_port(&self, name: &str) -> Option<&PortDef> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_port(&self, name: &str) -> Option<&PortDef> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// JSON form of a circuit
#[derive(Debug, Deserialize)]
struct CircuitIR {
    #[serde(default)]
    top: Option<String>,
    definitions: Vec<Definition>,
}

/// Container of all definitions for one compilation session
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    definitions: Vec<Definition>,
    by_name: HashMap<String, DefId>,
    top: Option<DefId>,
}

impl Circuit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let ir: CircuitIR = serde_json::from_str(json)?;
        let mut circuit = Circuit::new();
        for def in ir.definitions {
            circuit.add(def)?;
        }
        if let Some(top) = ir.top {
            let id = circuit.find(&top).ok_or(JitError::UnknownDefinition(top))?;
            circuit.top = Some(id);
        }
        circuit.validate()?;
        Ok(circuit)
    }

    /// Add a definition, returning its handle.
    pub fn add(&mut self, def: Definition) -> Result<DefId> {
        if self.by_name.contains_key(&def.name) {
            return Err(JitError::InvalidCircuit(format!("duplicate definition `{}`", def.name)));
        }
        let id = DefId(self.definitions.len());
        self.by_name.insert(def.name.clone(), id);
        self.definitions.push(def);
        Ok(id)
    }

    pub fn set_top(&mut self, id: DefId) {
        self.top = Some(id);
    }

    /// Top definition: the explicit one, else the last definition added.
    pub fn top(&self) -> Result<DefId> {
        match self.top {
            Some(id) => Ok(id),
            None if !self.definitions.is_empty() => Ok(DefId(self.definitions.len() - 1)),
            None => Err(JitError::InvalidCircuit("circuit has no definitions".into())),
        }
    }

    pub fn find(&self, name: &str) -> Option<DefId> {
        self.by_name.get(name).copied()
    }

    pub fn lookup(&self, name: &str) -> Result<DefId> {
        self.find(name).ok_or_else(|| JitError::UnknownDefinition(name.to_string()))
    }

    pub fn definition(&self, id: DefId) -> &Definition {
        &self.definitions[id.0]
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions reachable from `root`, children before parents.
    pub fn reachable(&self, root: DefId) -> Result<Vec<DefId>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut active = Vec::new();
        self.visit(root, &mut order, &mut done, &mut active)?;
        Ok(order)
    }

    fn visit(&self, id: DefId, order: &mut Vec<DefId>, done: &mut HashSet<DefId>, active: &mut Vec<DefId>) -> Result<()> {
        if done.contains(&id) {
            return Ok(());
        }
        if active.contains(&id) {
            let chain: Vec<&str> = active.iter().map(|d| self.definition(*d).name.as_str()).collect();
            return Err(JitError::InvalidCircuit(format!(
                "recursive instantiation of `{}` via {}",
                self.definition(id).name,
                chain.join(" -> ")
            )));
        }
        active.push(id);
        for inst in &self.definition(id).instances {
            if let InstanceKind::Definition { definition } = &inst.kind {
                let child = self.lookup(definition)?;
                self.visit(child, order, done, active)?;
            }
        }
        active.pop();
        done.insert(id);
        order.push(id);
        Ok(())
    }

    /// Structural checks that do not need primitive metadata.
    pub fn validate(&self) -> Result<()> {
        for def in &self.definitions {
            let mut names = HashSet::new();
            for port in def.inputs.iter().chain(&def.outputs) {
                if !names.insert(port.name.as_str()) {
                    return Err(JitError::InvalidCircuit(format!(
                        "duplicate port `{}` in `{}`",
                        port.name, def.name
                    )));
                }
                if port.width == 0 {
                    return Err(JitError::InvalidCircuit(format!(
                        "port `{}` of `{}` has zero width",
                        port.name, def.name
                    )));
                }
            }
            let mut instances = HashSet::new();
            for inst in &def.instances {
                if inst.name == "self" || inst.name.is_empty() || inst.name.contains('.') {
                    return Err(JitError::InvalidCircuit(format!(
                        "invalid instance name `{}` in `{}`",
                        inst.name, def.name
                    )));
                }
                if !instances.insert(inst.name.as_str()) {
                    return Err(JitError::InvalidCircuit(format!(
                        "duplicate instance `{}` in `{}`",
                        inst.name, def.name
                    )));
                }
                if let InstanceKind::Definition { definition } = &inst.kind {
                    self.lookup(definition)?;
                }
            }
        }
        Ok(())
    }
}
