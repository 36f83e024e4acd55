#![forbid(unsafe_code)]

//! Block-structured IR.
//!
//! A [`Block`] is an ordered sequence of instructions over a declared number
//! of input slots, each entry keeping the source span it was lowered from.
//! Labels are strings minted by a [`LabelAllocator`] owned by one
//! compilation session. The transformation operations (`shifted`,
//! `relabeled`, `chained`, `import_external`) never mutate their input
//! block: the same constraint block is routinely reused at different slot
//! offsets and with different failure targets within one compilation.

use std::collections::HashMap;

use crate::types::Type;
use crate::value::Value;
use crate::{QualifiedName, Span};

/// Mints process-unique label names for one compilation session.
#[derive(Debug, Default)]
pub struct LabelAllocator {
    next: u32,
}

impl LabelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> String {
        let n = self.next;
        self.next += 1;
        format!("blklab{n}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Subset,
    SubsetEq,
    ElemOf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Range,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Operand orientation for binary collection instructions: both operands
/// are collections, or only the left/right one is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpDir {
    Uniform,
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    Const(Value),
    ConstNull,
    /// A function handle constant; keeps the value model closed over
    /// first-order data.
    FunctionConst {
        name: QualifiedName,
        ty: Option<Type>,
    },
    Load(usize),
    Store(usize),
    Label(String),
    Goto(String),
    /// Pops two operands, jumps to `target` when the comparison holds.
    IfGo {
        op: CompOp,
        target: String,
    },
    /// Runtime type test; `slot` tests a local in place, `None` tests the
    /// popped operand.
    IfType {
        slot: Option<usize>,
        test: Type,
        target: String,
    },
    /// Unconditional failure with a fault message.
    Fail(String),
    /// Marks the start of a checked assertion ending at the label.
    Assert(String),
    Return(Type),
    Loop(String),
    /// Iterates the popped collection, binding each element to `slot`.
    ForAll {
        slot: usize,
        end: String,
    },
    End(String),
    Switch {
        default: String,
        cases: Vec<(Value, String)>,
    },
    /// Bracket for a protected region with ordered, first-match handlers.
    TryCatch {
        catches: Vec<(Type, String)>,
    },
    TryEnd(String),
    Throw,
    Debug,
    Skip,
    BinOp(ArithOp),
    Negate,
    Invert,
    LengthOf,
    IndexLoad,
    SubList,
    NewList(usize),
    NewSet(usize),
    NewDict(usize),
    NewTuple(usize),
    NewRecord(Vec<String>),
    FieldLoad(String),
    /// Multi-level update of a local: `depth` access levels, of which
    /// `fields` are the named ones; index operands are on the stack.
    Update {
        slot: usize,
        depth: usize,
        fields: Vec<String>,
    },
    Destructure,
    Convert(Type),
    SetUnion(OpDir),
    SetIntersect(OpDir),
    SetDifference(OpDir),
    StringAppend(OpDir),
    ListAppend(OpDir),
    Invoke {
        name: QualifiedName,
        retval: bool,
    },
    IndirectInvoke {
        retval: bool,
    },
    Send {
        name: QualifiedName,
        synchronous: bool,
        retval: bool,
    },
    IndirectSend {
        synchronous: bool,
        retval: bool,
    },
    Spawn,
}

impl Instr {
    fn remap_slots(&self, map: &dyn Fn(usize) -> usize) -> Instr {
        match self {
            Instr::Load(s) => Instr::Load(map(*s)),
            Instr::Store(s) => Instr::Store(map(*s)),
            Instr::IfType { slot, test, target } => Instr::IfType {
                slot: slot.map(map),
                test: test.clone(),
                target: target.clone(),
            },
            Instr::ForAll { slot, end } => Instr::ForAll {
                slot: map(*slot),
                end: end.clone(),
            },
            Instr::Update { slot, depth, fields } => Instr::Update {
                slot: map(*slot),
                depth: *depth,
                fields: fields.clone(),
            },
            other => other.clone(),
        }
    }

    fn rename_labels(&self, map: &HashMap<String, String>) -> Instr {
        let rename = |l: &String| map.get(l).cloned().unwrap_or_else(|| l.clone());
        match self {
            Instr::Label(l) => Instr::Label(rename(l)),
            Instr::Goto(l) => Instr::Goto(rename(l)),
            Instr::IfGo { op, target } => Instr::IfGo {
                op: *op,
                target: rename(target),
            },
            Instr::IfType { slot, test, target } => Instr::IfType {
                slot: *slot,
                test: test.clone(),
                target: rename(target),
            },
            Instr::Assert(l) => Instr::Assert(rename(l)),
            Instr::Loop(l) => Instr::Loop(rename(l)),
            Instr::ForAll { slot, end } => Instr::ForAll {
                slot: *slot,
                end: rename(end),
            },
            Instr::End(l) => Instr::End(rename(l)),
            Instr::Switch { default, cases } => Instr::Switch {
                default: rename(default),
                cases: cases
                    .iter()
                    .map(|(v, l)| (v.clone(), rename(l)))
                    .collect(),
            },
            Instr::TryCatch { catches } => Instr::TryCatch {
                catches: catches
                    .iter()
                    .map(|(t, l)| (t.clone(), rename(l)))
                    .collect(),
            },
            Instr::TryEnd(l) => Instr::TryEnd(rename(l)),
            other => other.clone(),
        }
    }

    /// The label this instruction declares, if any. Every other label
    /// occurrence is a reference to a declaration elsewhere.
    fn declared_label(&self) -> Option<&str> {
        match self {
            Instr::Label(l) | Instr::Loop(l) | Instr::TryEnd(l) => Some(l),
            Instr::ForAll { end, .. } => Some(end),
            _ => None,
        }
    }

    fn referenced_slots(&self, out: &mut Vec<usize>) {
        match self {
            Instr::Load(s) | Instr::Store(s) => out.push(*s),
            Instr::IfType { slot: Some(s), .. } => out.push(*s),
            Instr::ForAll { slot, .. } => out.push(*slot),
            Instr::Update { slot, .. } => out.push(*slot),
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub instr: Instr,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    num_inputs: usize,
    entries: Vec<Entry>,
}

impl Block {
    pub fn new(num_inputs: usize) -> Block {
        Block {
            num_inputs,
            entries: Vec::new(),
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// One past the highest slot referenced anywhere in the block, or the
    /// declared input count if that is larger.
    pub fn num_slots(&self) -> usize {
        let mut slots = Vec::new();
        for e in &self.entries {
            e.instr.referenced_slots(&mut slots);
        }
        slots
            .into_iter()
            .map(|s| s + 1)
            .max()
            .unwrap_or(0)
            .max(self.num_inputs)
    }

    pub fn push(&mut self, instr: Instr, span: Span) {
        self.entries.push(Entry { instr, span });
    }

    /// Splices a whole sub-block, preserving each entry's own span.
    pub fn append(&mut self, other: Block) {
        self.entries.extend(other.entries);
    }

    /// Returns a copy with every slot reference offset by `amount` and all
    /// declared labels freshened. Used to reuse one constraint block across
    /// frames with different parameter layouts.
    pub fn shifted(&self, amount: usize, labels: &mut LabelAllocator) -> Block {
        let mut out = Block::new(self.num_inputs);
        for e in &self.entries {
            out.push(e.instr.remap_slots(&|s| s + amount), e.span);
        }
        out.relabeled(labels)
    }

    /// Returns a copy whose declared labels are consistently replaced with
    /// fresh ones; references to labels declared outside the block are left
    /// untouched.
    pub fn relabeled(&self, labels: &mut LabelAllocator) -> Block {
        let mut map = HashMap::new();
        for e in &self.entries {
            if let Some(declared) = e.instr.declared_label() {
                map.entry(declared.to_string())
                    .or_insert_with(|| labels.fresh());
            }
        }
        let mut out = Block::new(self.num_inputs);
        for e in &self.entries {
            out.push(e.instr.rename_labels(&map), e.span);
        }
        out
    }

    /// Returns a copy in which every unconditional failure becomes a jump
    /// to `target`, so a failing constraint disjunct falls through to the
    /// next disjunct instead of aborting.
    pub fn chained(&self, target: &str, labels: &mut LabelAllocator) -> Block {
        let mut out = Block::new(self.num_inputs);
        for e in &self.entries {
            match &e.instr {
                Instr::Fail(_) => out.push(Instr::Goto(target.to_string()), e.span),
                other => out.push(other.clone(), e.span),
            }
        }
        out.relabeled(labels)
    }

    /// Splices a foreign block, remapping its bound slots through `binding`
    /// and renting fresh slots past this block's frame for its
    /// temporaries. Used to rebind a type constraint's reserved slot 0
    /// onto a parameter's actual slot.
    pub fn import_external(
        &mut self,
        external: &Block,
        binding: &HashMap<usize, usize>,
        labels: &mut LabelAllocator,
    ) {
        let mut mapping = binding.clone();
        let mut next = self.num_slots().max(
            binding.values().map(|s| s + 1).max().unwrap_or(0),
        );
        let mut referenced = Vec::new();
        for e in &external.entries {
            e.instr.referenced_slots(&mut referenced);
        }
        referenced.sort_unstable();
        referenced.dedup();
        for slot in referenced {
            mapping.entry(slot).or_insert_with(|| {
                let fresh = next;
                next += 1;
                fresh
            });
        }

        let mut imported = Block::new(external.num_inputs);
        for e in &external.entries {
            imported.push(e.instr.remap_slots(&|s| mapping[&s]), e.span);
        }
        self.append(imported.relabeled(labels));
    }
}

impl<'a> IntoIterator for &'a Block {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span;

    fn sp() -> Span {
        span(0, 0)
    }

    fn constraint_block() -> Block {
        // slot 0 >= 0, else fail
        let mut blk = Block::new(1);
        blk.push(Instr::Load(0), sp());
        blk.push(Instr::Const(Value::int(0)), sp());
        blk.push(
            Instr::IfGo {
                op: CompOp::Ge,
                target: "ok".to_string(),
            },
            sp(),
        );
        blk.push(Instr::Fail("constraint not satisfied".to_string()), sp());
        blk.push(Instr::Label("ok".to_string()), sp());
        blk
    }

    #[test]
    fn append_preserves_per_entry_spans() {
        let mut a = Block::new(0);
        a.push(Instr::Skip, span(1, 2));
        let mut b = Block::new(0);
        b.push(Instr::Debug, span(7, 3));
        a.append(b);
        assert_eq!(a.entries()[0].span, span(1, 2));
        assert_eq!(a.entries()[1].span, span(7, 3));
    }

    #[test]
    fn shifted_offsets_slots_and_leaves_source_untouched() {
        let original = constraint_block();
        let mut labels = LabelAllocator::new();
        let shifted = original.shifted(3, &mut labels);

        assert_eq!(shifted.entries()[0].instr, Instr::Load(3));
        // The source block is unchanged, including its labels.
        assert_eq!(original.entries()[0].instr, Instr::Load(0));
        assert_eq!(
            original.entries()[4].instr,
            Instr::Label("ok".to_string())
        );
    }

    #[test]
    fn relabeled_freshens_declarations_consistently() {
        let original = constraint_block();
        let mut labels = LabelAllocator::new();
        let renamed = original.relabeled(&mut labels);

        let target = match &renamed.entries()[2].instr {
            Instr::IfGo { target, .. } => target.clone(),
            other => panic!("expected IfGo, got {other:?}"),
        };
        assert_ne!(target, "ok");
        assert_eq!(renamed.entries()[4].instr, Instr::Label(target));
    }

    #[test]
    fn relabeled_leaves_external_targets_alone() {
        let mut blk = Block::new(0);
        blk.push(Instr::Goto("elsewhere".to_string()), sp());
        let mut labels = LabelAllocator::new();
        let renamed = blk.relabeled(&mut labels);
        assert_eq!(
            renamed.entries()[0].instr,
            Instr::Goto("elsewhere".to_string())
        );
    }

    #[test]
    fn chained_rewrites_fail_to_goto() {
        let original = constraint_block();
        let mut labels = LabelAllocator::new();
        let chained = original.chained("next_disjunct", &mut labels);

        assert_eq!(
            chained.entries()[3].instr,
            Instr::Goto("next_disjunct".to_string())
        );
        assert!(matches!(original.entries()[3].instr, Instr::Fail(_)));
    }

    #[test]
    fn import_external_rebinds_bound_slots_and_rents_temporaries() {
        let mut host = Block::new(4);
        host.push(Instr::Load(3), sp());

        let mut external = Block::new(1);
        external.push(Instr::Load(0), sp());
        external.push(Instr::Store(1), sp()); // a temporary of the constraint
        external.push(Instr::Fail("bad".to_string()), sp());

        let mut labels = LabelAllocator::new();
        host.import_external(&external, &HashMap::from([(0, 2)]), &mut labels);

        assert_eq!(host.entries()[1].instr, Instr::Load(2));
        // The constraint temporary lands past the host frame.
        assert_eq!(host.entries()[2].instr, Instr::Store(4));
    }

    #[test]
    fn num_slots_counts_inputs_and_references() {
        let mut blk = Block::new(2);
        assert_eq!(blk.num_slots(), 2);
        blk.push(Instr::Store(6), sp());
        assert_eq!(blk.num_slots(), 7);
    }
}
