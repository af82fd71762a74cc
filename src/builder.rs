//! Definition Builder
//!
//! Lowers a [`Definition`] to native code in three passes:
//!
//! 1. **Flatten** the instance hierarchy into primitive nodes, resolving every
//!    primitive input pin to the pin that ultimately drives it and assigning
//!    each stateful node a slice of the state buffer in first-encounter order.
//! 2. **Schedule** nodes so every node's compute inputs are emitted before it.
//!    Only the inputs a primitive's compute recipe reads form edges, so loops
//!    through a register or memory are legal.
//! 3. **Emit** `<def>_compute_output` and `<def>_update_state` against a
//!    [`CodeEmitter`].
//!
//! A sub-definition's state occupies one contiguous range of its parent's
//! state, laid out exactly as when the sub-definition is compiled on its own.

use std::collections::{HashMap, VecDeque};

use cranelift_module::FuncId;
use tracing::trace;

use crate::abi::AbiLayout;
use crate::circuit::{Circuit, DefId, Definition, InstanceKind, PinRef, PortDef};
use crate::emitter::{check_native_width, container_bytes, store_field, CodeEmitter};
use crate::error::{JitError, Result};
use crate::jit::{CodeModule, Param};
use crate::primitives::{Primitive, PrimitiveLibrary};

/// Where a signal value comes from once the hierarchy is flattened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// Input port of the flattened definition
    Input(usize),
    /// Output pin of a primitive node
    Node { node: usize, output: usize },
}

/// One primitive instance of the flattened definition
#[derive(Debug, Clone)]
pub struct FlatNode {
    /// Instance names from the flattened definition down to this primitive.
    pub path: Vec<String>,
    pub primitive: Primitive,
    /// Driver of each input pin, in `input_names` order.
    pub inputs: Vec<Source>,
    pub state_offset: usize,
    /// Definition that directly contains this instance.
    pub definition: DefId,
}

impl FlatNode {
    pub fn path_string(&self) -> String {
        self.path.join(".")
    }
}

/// An instance input pin whose value can be captured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapPoint {
    pub path: Vec<String>,
    pub pin: String,
    pub width: u32,
    pub source: Source,
    pub definition: DefId,
}

/// A definition flattened into scheduled primitive nodes
#[derive(Debug, Clone)]
pub struct FlatGraph {
    pub name: String,
    pub definition: DefId,
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<(PortDef, Source)>,
    pub nodes: Vec<FlatNode>,
    /// Node indices in emission order.
    pub order: Vec<usize>,
    pub state_bytes: usize,
    pub taps: Vec<TapPoint>,
}

impl FlatGraph {
    pub fn compute_symbol(&self) -> String {
        format!("{}_compute_output", self.name)
    }

    pub fn update_symbol(&self) -> String {
        format!("{}_update_state", self.name)
    }

    pub fn capture_symbol(&self) -> String {
        format!("{}_capture_values", self.name)
    }

    fn input_params(&self) -> impl Iterator<Item = Param> + '_ {
        self.inputs.iter().map(|p| Param::Int(p.width))
    }

    /// `(inputs.., state, out_0*, .., out_n*)`
    pub fn compute_params(&self) -> Vec<Param> {
        let mut params: Vec<Param> = self.input_params().collect();
        params.push(Param::Ptr);
        params.extend(self.outputs.iter().map(|_| Param::Ptr));
        params
    }

    /// `(inputs.., state)`
    pub fn update_params(&self) -> Vec<Param> {
        let mut params: Vec<Param> = self.input_params().collect();
        params.push(Param::Ptr);
        params
    }

    /// `(inputs.., state, debug*)`
    pub fn capture_params(&self) -> Vec<Param> {
        let mut params = self.update_params();
        params.push(Param::Ptr);
        params
    }
}

// ============================================================================
// Flattening
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Driver {
    Undriven,
    Source(Source),
    Alias(usize),
}

#[derive(Debug)]
struct Slot {
    name: String,
    width: u32,
    driver: Driver,
}

enum Local {
    Primitive(usize),
    Definition {
        def: DefId,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
    },
}

struct PendingTap {
    path: Vec<String>,
    pin: String,
    width: u32,
    slot: usize,
    definition: DefId,
}

fn pin_name(path: &[String], pin: &str) -> String {
    if path.is_empty() {
        format!("self.{}", pin)
    } else {
        format!("{}.{}", path.join("."), pin)
    }
}

fn ref_name(path: &[String], pin: &PinRef) -> String {
    match &pin.instance {
        Some(instance) if path.is_empty() => format!("{}.{}", instance, pin.port),
        Some(instance) => format!("{}.{}.{}", path.join("."), instance, pin.port),
        None => pin_name(path, &pin.port),
    }
}

struct Flattener<'c> {
    circuit: &'c Circuit,
    library: &'c PrimitiveLibrary,
    slots: Vec<Slot>,
    nodes: Vec<FlatNode>,
    node_slots: Vec<Vec<usize>>,
    taps: Vec<PendingTap>,
    state_bytes: usize,
}

impl<'c> Flattener<'c> {
    fn new_slot(&mut self, name: String, width: u32, driver: Driver) -> usize {
        self.slots.push(Slot { name, width, driver });
        self.slots.len() - 1
    }

    /// Elaborate `id` at `path` with its input ports bound to `inputs`;
    /// returns the slots of its output ports.
    fn elaborate(&mut self, id: DefId, path: &[String], inputs: &[usize]) -> Result<Vec<usize>> {
        let circuit = self.circuit;
        let def = circuit.definition(id);

        for port in def.inputs.iter().chain(&def.outputs) {
            check_native_width(&format!("port `{}`", pin_name(path, &port.name)), port.width)?;
        }

        let outputs: Vec<usize> = def
            .outputs
            .iter()
            .map(|p| self.new_slot(pin_name(path, &p.name), p.width, Driver::Undriven))
            .collect();

        let mut locals: HashMap<&str, Local> = HashMap::with_capacity(def.instances.len());
        for inst in &def.instances {
            let mut inst_path = path.to_vec();
            inst_path.push(inst.name.clone());

            match &inst.kind {
                InstanceKind::Primitive { primitive, args } => {
                    let prim = self.library.build(primitive, args, &inst_path.join("."))?;
                    let node = self.nodes.len();
                    let mut slots = Vec::with_capacity(prim.input_names().len());
                    for (pin, width) in prim.input_names().iter().zip(prim.input_widths()) {
                        let slot = self.new_slot(pin_name(&inst_path, pin), width, Driver::Undriven);
                        self.taps.push(PendingTap {
                            path: inst_path.clone(),
                            pin: pin.to_string(),
                            width,
                            slot,
                            definition: id,
                        });
                        slots.push(slot);
                    }

                    let state_offset = self.state_bytes;
                    if prim.is_stateful() {
                        self.state_bytes += prim.state_bytes();
                    }
                    trace!(node, path = %inst_path.join("."), kind = prim.kind_name(), state_offset, "flattened primitive");

                    self.nodes.push(FlatNode {
                        path: inst_path,
                        primitive: prim,
                        inputs: Vec::new(),
                        state_offset,
                        definition: id,
                    });
                    self.node_slots.push(slots);
                    locals.insert(inst.name.as_str(), Local::Primitive(node));
                }
                InstanceKind::Definition { definition } => {
                    let child = circuit.lookup(definition)?;
                    let child_def = circuit.definition(child);
                    let mut child_inputs = Vec::with_capacity(child_def.inputs.len());
                    for port in &child_def.inputs {
                        let slot = self.new_slot(pin_name(&inst_path, &port.name), port.width, Driver::Undriven);
                        self.taps.push(PendingTap {
                            path: inst_path.clone(),
                            pin: port.name.clone(),
                            width: port.width,
                            slot,
                            definition: id,
                        });
                        child_inputs.push(slot);
                    }
                    let child_outputs = self.elaborate(child, &inst_path, &child_inputs)?;
                    locals.insert(
                        inst.name.as_str(),
                        Local::Definition {
                            def: child,
                            inputs: child_inputs,
                            outputs: child_outputs,
                        },
                    );
                }
            }
        }

        for net in &def.nets {
            let (driver, width) = self.net_source(def, &locals, inputs, &net.source)?;
            for sink in &net.sinks {
                let slot = self.net_sink(def, &locals, &outputs, sink)?;
                let target = &mut self.slots[slot];
                if target.width != width {
                    return Err(JitError::NetWidthMismatch {
                        from: ref_name(path, &net.source),
                        to: ref_name(path, sink),
                        from_width: width,
                        to_width: target.width,
                    });
                }
                if !matches!(target.driver, Driver::Undriven) {
                    return Err(JitError::MultipleDrivers(target.name.clone()));
                }
                target.driver = driver;
            }
        }

        Ok(outputs)
    }

    fn unknown_pin(def: &Definition, pin: &PinRef) -> JitError {
        JitError::UnknownPin {
            definition: def.name.clone(),
            pin: pin.to_string(),
        }
    }

    fn wrong_direction(def: &Definition, pin: &PinRef, role: &str) -> JitError {
        JitError::InvalidCircuit(format!("pin `{}` in `{}` cannot be a net {}", pin, def.name, role))
    }

    fn net_source(&self, def: &Definition, locals: &HashMap<&str, Local>, inputs: &[usize], pin: &PinRef) -> Result<(Driver, u32)> {
        let Some(instance) = &pin.instance else {
            if let Some(i) = def.inputs.iter().position(|p| p.name == pin.port) {
                return Ok((Driver::Alias(inputs[i]), def.inputs[i].width));
            }
            if def.output_port(&pin.port).is_some() {
                return Err(Self::wrong_direction(def, pin, "source"));
            }
            return Err(Self::unknown_pin(def, pin));
        };

        match locals.get(instance.as_str()) {
            Some(Local::Primitive(node)) => {
                let prim = &self.nodes[*node].primitive;
                if let Some(k) = prim.output_names().iter().position(|n| *n == pin.port) {
                    return Ok((Driver::Source(Source::Node { node: *node, output: k }), prim.output_widths()[k]));
                }
                if prim.input_names().contains(&pin.port.as_str()) {
                    return Err(Self::wrong_direction(def, pin, "source"));
                }
                Err(Self::unknown_pin(def, pin))
            }
            Some(Local::Definition { def: child, outputs, .. }) => {
                let child_def = self.circuit.definition(*child);
                if let Some(k) = child_def.outputs.iter().position(|p| p.name == pin.port) {
                    return Ok((Driver::Alias(outputs[k]), child_def.outputs[k].width));
                }
                if child_def.input_port(&pin.port).is_some() {
                    return Err(Self::wrong_direction(def, pin, "source"));
                }
                Err(Self::unknown_pin(def, pin))
            }
            None => Err(Self::unknown_pin(def, pin)),
        }
    }

    fn net_sink(&self, def: &Definition, locals: &HashMap<&str, Local>, outputs: &[usize], pin: &PinRef) -> Result<usize> {
        let Some(instance) = &pin.instance else {
            if let Some(k) = def.outputs.iter().position(|p| p.name == pin.port) {
                return Ok(outputs[k]);
            }
            if def.input_port(&pin.port).is_some() {
                return Err(Self::wrong_direction(def, pin, "sink"));
            }
            return Err(Self::unknown_pin(def, pin));
        };

        match locals.get(instance.as_str()) {
            Some(Local::Primitive(node)) => {
                let prim = &self.nodes[*node].primitive;
                if let Some(k) = prim.input_names().iter().position(|n| *n == pin.port) {
                    return Ok(self.node_slots[*node][k]);
                }
                if prim.output_names().contains(&pin.port.as_str()) {
                    return Err(Self::wrong_direction(def, pin, "sink"));
                }
                Err(Self::unknown_pin(def, pin))
            }
            Some(Local::Definition { def: child, inputs, .. }) => {
                let child_def = self.circuit.definition(*child);
                if let Some(k) = child_def.inputs.iter().position(|p| p.name == pin.port) {
                    return Ok(inputs[k]);
                }
                if child_def.output_port(&pin.port).is_some() {
                    return Err(Self::wrong_direction(def, pin, "sink"));
                }
                Err(Self::unknown_pin(def, pin))
            }
            None => Err(Self::unknown_pin(def, pin)),
        }
    }

    /// Follow aliases from `slot` to the pin that drives it.
    fn resolve(&self, slot: usize) -> Result<Source> {
        let mut seen = Vec::new();
        let mut current = slot;
        loop {
            match self.slots[current].driver {
                Driver::Source(source) => return Ok(source),
                Driver::Undriven => return Err(JitError::UndrivenPin(self.slots[current].name.clone())),
                Driver::Alias(next) => {
                    if seen.contains(&current) {
                        let names = seen.iter().map(|s: &usize| self.slots[*s].name.clone()).collect();
                        return Err(JitError::CombinationalCycle(names));
                    }
                    seen.push(current);
                    current = next;
                }
            }
        }
    }
}

/// Order nodes so each follows the producers of its compute inputs.
fn schedule(nodes: &[FlatNode]) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &k in node.primitive.compute_inputs() {
            if let Source::Node { node: producer, .. } = node.inputs[k] {
                indegree[i] += 1;
                users[producer].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        trace!(node = i, path = %nodes[i].path_string(), "scheduled");
        order.push(i);
        for &user in &users[i] {
            indegree[user] -= 1;
            if indegree[user] == 0 {
                ready.push_back(user);
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck = (0..nodes.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| nodes[i].path_string())
            .collect();
        return Err(JitError::CombinationalCycle(stuck));
    }
    Ok(order)
}

// ============================================================================
// Emission
// ============================================================================

/// Emitted values of every signal of a flattened definition
pub struct SignalValues<V> {
    inputs: Vec<V>,
    nodes: Vec<Vec<V>>,
}

impl<V: Copy> SignalValues<V> {
    pub fn get(&self, source: Source) -> V {
        match source {
            Source::Input(i) => self.inputs[i],
            Source::Node { node, output } => self.nodes[node][output],
        }
    }
}

/// Emit the compute recipe of every node in schedule order.
pub fn emit_signal_values<E: CodeEmitter>(
    e: &mut E,
    graph: &FlatGraph,
    inputs: Vec<E::Value>,
    state: E::Value,
) -> Result<SignalValues<E::Value>> {
    let mut values = SignalValues {
        inputs,
        nodes: vec![Vec::new(); graph.nodes.len()],
    };
    for &i in &graph.order {
        let node = &graph.nodes[i];
        let args: Vec<E::Value> = node
            .primitive
            .compute_inputs()
            .iter()
            .map(|k| values.get(node.inputs[*k]))
            .collect();
        let slice = e.offset_ptr(state, node.state_offset as i64);
        values.nodes[i] = node.primitive.emit_compute(e, &args, slice)?;
    }
    Ok(values)
}

fn input_values<E: CodeEmitter>(e: &mut E, graph: &FlatGraph) -> Vec<E::Value> {
    (0..graph.inputs.len()).map(|i| e.param(i)).collect()
}

/// Body of `<def>_compute_output(inputs.., state, out_0*, ..)`. Each output
/// pointer receives the value zero-extended to its container size.
pub fn emit_compute_body<E: CodeEmitter>(e: &mut E, graph: &FlatGraph) -> Result<()> {
    let inputs = input_values(e, graph);
    let state = e.param(graph.inputs.len());
    let values = emit_signal_values(e, graph, inputs, state)?;
    for (j, (port, source)) in graph.outputs.iter().enumerate() {
        let ptr = e.param(graph.inputs.len() + 1 + j);
        let value = values.get(*source);
        e.store(value, ptr, 0, container_bytes(port.width));
    }
    Ok(())
}

/// Body of `<def>_update_state(inputs.., state)`. All nodes are evaluated
/// against the old state before any stateful node stores.
pub fn emit_update_body<E: CodeEmitter>(e: &mut E, graph: &FlatGraph) -> Result<()> {
    let inputs = input_values(e, graph);
    let state = e.param(graph.inputs.len());
    let values = emit_signal_values(e, graph, inputs, state)?;
    for node in graph.nodes.iter().filter(|n| n.primitive.is_stateful()) {
        let args: Vec<E::Value> = node.inputs.iter().map(|s| values.get(*s)).collect();
        let slice = e.offset_ptr(state, node.state_offset as i64);
        node.primitive.emit_update(e, &args, slice)?;
    }
    Ok(())
}

/// Body of `<def>_capture_values(inputs.., state, debug*)`: stores the value
/// of tap `i` into member `i` of `record`.
pub fn emit_capture_body<E: CodeEmitter>(e: &mut E, graph: &FlatGraph, record: &AbiLayout) -> Result<()> {
    let inputs = input_values(e, graph);
    let state = e.param(graph.inputs.len());
    let debug = e.param(graph.inputs.len() + 1);
    let values = emit_signal_values(e, graph, inputs, state)?;
    for (tap, member) in graph.taps.iter().zip(record.members()) {
        store_field(e, debug, member.placement(), values.get(tap.source))?;
    }
    Ok(())
}

/// Function ids of one built definition
#[derive(Debug, Clone, Copy)]
pub struct DefinitionFuncs {
    pub compute: FuncId,
    pub update: FuncId,
}

/// Builds definitions of one circuit with one primitive library
pub struct DefinitionBuilder<'c> {
    circuit: &'c Circuit,
    library: &'c PrimitiveLibrary,
}

impl<'c> DefinitionBuilder<'c> {
    pub fn new(circuit: &'c Circuit, library: &'c PrimitiveLibrary) -> Self {
        Self { circuit, library }
    }

    pub fn circuit(&self) -> &'c Circuit {
        self.circuit
    }

    /// Flatten and schedule `id`.
    pub fn flatten(&self, id: DefId) -> Result<FlatGraph> {
        self.circuit.reachable(id)?;
        let def = self.circuit.definition(id);

        let mut flat = Flattener {
            circuit: self.circuit,
            library: self.library,
            slots: Vec::new(),
            nodes: Vec::new(),
            node_slots: Vec::new(),
            taps: Vec::new(),
            state_bytes: 0,
        };
        let inputs: Vec<usize> = def
            .inputs
            .iter()
            .enumerate()
            .map(|(i, p)| flat.new_slot(pin_name(&[], &p.name), p.width, Driver::Source(Source::Input(i))))
            .collect();
        let output_slots = flat.elaborate(id, &[], &inputs)?;

        let mut nodes = std::mem::take(&mut flat.nodes);
        for (node, slots) in nodes.iter_mut().zip(&flat.node_slots) {
            node.inputs = slots.iter().map(|s| flat.resolve(*s)).collect::<Result<_>>()?;
        }
        let outputs = def
            .outputs
            .iter()
            .zip(&output_slots)
            .map(|(port, slot)| Ok((port.clone(), flat.resolve(*slot)?)))
            .collect::<Result<Vec<_>>>()?;
        let taps = flat
            .taps
            .iter()
            .map(|t| {
                Ok(TapPoint {
                    path: t.path.clone(),
                    pin: t.pin.clone(),
                    width: t.width,
                    source: flat.resolve(t.slot)?,
                    definition: t.definition,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let order = schedule(&nodes)?;
        Ok(FlatGraph {
            name: def.name.clone(),
            definition: id,
            inputs: def.inputs.clone(),
            outputs,
            nodes,
            order,
            state_bytes: flat.state_bytes,
            taps,
        })
    }

    /// Declare and define the exported compute and update functions of `graph`.
    pub fn build(&self, code: &mut CodeModule, graph: &FlatGraph) -> Result<DefinitionFuncs> {
        let compute = code.declare_function(&graph.compute_symbol(), &graph.compute_params(), true)?;
        let update = code.declare_function(&graph.update_symbol(), &graph.update_params(), true)?;
        code.define_function(compute, |e| emit_compute_body(e, graph))?;
        code.define_function(update, |e| emit_update_body(e, graph))?;
        Ok(DefinitionFuncs { compute, update })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::LayoutRules;
    use crate::emitter::eval::EvalEmitter;

    fn counter() -> Definition {
        Definition::new("counter")
            .output("count", 8)
            .primitive("r", "register", &[("width", 8)])
            .primitive("one", "const", &[("width", 8), ("value", 1)])
            .primitive("inc", "add", &[("width", 8)])
            .net("r.out", &["inc.lhs", "self.count"])
            .net("one.out", &["inc.rhs"])
            .net("inc.sum", &["r.in"])
    }

    fn flatten(defs: Vec<Definition>) -> Result<FlatGraph> {
        let mut circuit = Circuit::new();
        for def in defs {
            circuit.add(def)?;
        }
        let library = PrimitiveLibrary::builtin();
        let top = circuit.top()?;
        DefinitionBuilder::new(&circuit, &library).flatten(top)
    }

    #[test]
    fn test_flatten_counter() {
        let graph = flatten(vec![counter()]).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.state_bytes, 1);
        assert_eq!(graph.order, vec![0, 1, 2]);
        assert_eq!(graph.outputs[0].1, Source::Node { node: 0, output: 0 });
        assert_eq!(graph.nodes[2].inputs, vec![Source::Node { node: 0, output: 0 }, Source::Node { node: 1, output: 0 }]);
        assert_eq!(graph.compute_params(), vec![Param::Ptr, Param::Ptr]);
    }

    #[test]
    fn test_counter_bodies() {
        let graph = flatten(vec![counter()]).unwrap();

        let mut e = EvalEmitter::new(16).with_params(&[0, 8]);
        e.fill(0, &[5]);
        emit_compute_body(&mut e, &graph).unwrap();
        assert_eq!(e.memory()[8], 5);

        let mut e = EvalEmitter::new(1).with_params(&[0]);
        e.fill(0, &[0xff]);
        emit_update_body(&mut e, &graph).unwrap();
        assert_eq!(e.memory()[0], 0);
    }

    #[test]
    fn test_nested_state_layout() {
        let top = Definition::new("top")
            .output("a", 8)
            .output("b", 8)
            .instance("c0", "counter")
            .instance("c1", "counter")
            .net("c0.count", &["self.a"])
            .net("c1.count", &["self.b"]);
        let graph = flatten(vec![counter(), top]).unwrap();
        assert_eq!(graph.state_bytes, 2);
        let regs: Vec<(String, usize)> = graph
            .nodes
            .iter()
            .filter(|n| n.primitive.is_stateful())
            .map(|n| (n.path_string(), n.state_offset))
            .collect();
        assert_eq!(regs, vec![("c0.r".to_string(), 0), ("c1.r".to_string(), 1)]);
        assert_eq!(graph.outputs[1].1, Source::Node { node: 3, output: 0 });
    }

    #[test]
    fn test_taps_follow_sub_definitions() {
        let inner = Definition::new("inner")
            .input("x", 4)
            .output("y", 4)
            .primitive("n", "not", &[("width", 4)])
            .net("self.x", &["n.in"])
            .net("n.out", &["self.y"]);
        let top = Definition::new("top")
            .input("i", 4)
            .output("o", 4)
            .instance("u", "inner")
            .net("self.i", &["u.x"])
            .net("u.y", &["self.o"]);
        let graph = flatten(vec![inner, top]).unwrap();
        let taps: Vec<(String, &str, Source)> = graph
            .taps
            .iter()
            .map(|t| (t.path.join("."), t.pin.as_str(), t.source))
            .collect();
        assert_eq!(
            taps,
            vec![
                ("u".to_string(), "x", Source::Input(0)),
                ("u.n".to_string(), "in", Source::Input(0)),
            ]
        );
    }

    #[test]
    fn test_register_breaks_cycle() {
        // counter already loops through its register
        assert!(flatten(vec![counter()]).is_ok());
    }

    #[test]
    fn test_combinational_cycle() {
        let def = Definition::new("loop")
            .output("o", 8)
            .primitive("a", "add", &[("width", 8)])
            .primitive("k", "const", &[("width", 8), ("value", 1)])
            .net("a.sum", &["a.lhs", "self.o"])
            .net("k.out", &["a.rhs"]);
        let err = flatten(vec![def]).unwrap_err();
        assert!(matches!(err, JitError::CombinationalCycle(ref nodes) if nodes == &["a".to_string()]));
    }

    #[test]
    fn test_alias_cycle_through_sub_definition() {
        let pass = Definition::new("pass").input("x", 1).output("y", 1).net("self.x", &["self.y"]);
        let top = Definition::new("top").output("o", 1).instance("p", "pass").net("p.y", &["p.x", "self.o"]);
        assert!(matches!(flatten(vec![pass, top]), Err(JitError::CombinationalCycle(_))));
    }

    #[test]
    fn test_net_errors() {
        let twice = Definition::new("twice")
            .input("a", 8)
            .input("b", 8)
            .output("o", 8)
            .net("self.a", &["self.o"])
            .net("self.b", &["self.o"]);
        assert!(matches!(flatten(vec![twice]), Err(JitError::MultipleDrivers(ref p)) if p == "self.o"));

        let narrow = Definition::new("narrow").input("a", 4).output("o", 8).net("self.a", &["self.o"]);
        assert!(matches!(flatten(vec![narrow]), Err(JitError::NetWidthMismatch { from_width: 4, to_width: 8, .. })));

        let unknown = Definition::new("unknown").output("o", 8).net("ghost.out", &["self.o"]);
        assert!(matches!(flatten(vec![unknown]), Err(JitError::UnknownPin { .. })));

        let undriven = Definition::new("undriven").output("o", 8).primitive("n", "not", &[("width", 8)]).net("n.out", &["self.o"]);
        assert!(matches!(flatten(vec![undriven]), Err(JitError::UndrivenPin(ref p)) if p == "n.in"));

        let backwards = Definition::new("backwards").input("a", 8).output("o", 8).net("self.o", &["self.a"]);
        assert!(matches!(flatten(vec![backwards]), Err(JitError::InvalidCircuit(_))));
    }

    #[test]
    fn test_unknown_primitive_names_instance_path() {
        let inner = Definition::new("inner").primitive("bad", "coreir.slice", &[("width", 8)]);
        let top = Definition::new("top").instance("u", "inner");
        let err = flatten(vec![inner, top]).unwrap_err();
        assert!(matches!(err, JitError::UnknownPrimitive { ref instance, .. } if instance == "u.bad"));
    }

    #[test]
    fn test_wide_port_rejected() {
        let def = Definition::new("wide").input("a", 200).output("o", 200).net("self.a", &["self.o"]);
        assert!(matches!(flatten(vec![def]), Err(JitError::UnsupportedWidth { width: 200, .. })));
    }

    #[test]
    fn test_capture_body() {
        let def = Definition::new("pair")
            .input("a", 3)
            .input("b", 3)
            .output("s", 3)
            .primitive("x", "xor", &[("width", 3)])
            .net("self.a", &["x.lhs"])
            .net("self.b", &["x.rhs"])
            .net("x.out", &["self.s"]);
        let graph = flatten(vec![def]).unwrap();
        let members: Vec<(String, u32)> = graph.taps.iter().map(|t| (format!("{}.{}", t.path.join("."), t.pin), t.width)).collect();
        let layout = AbiLayout::new(&members, LayoutRules::BitPacked).unwrap();
        assert_eq!(layout.size(), 1);

        let mut e = EvalEmitter::new(2).with_params(&[0b101, 0b011, 0, 1]);
        emit_capture_body(&mut e, &graph, &layout).unwrap();
        assert_eq!(e.memory()[1], 0b011_101);
    }
}
