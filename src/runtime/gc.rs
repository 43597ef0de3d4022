use std::collections::HashMap;

use crate::lang::value::{Value, ValueRef, NONE_REF};

/// Default logical capacity of each space, in bytes.
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Per-cell bookkeeping cost added to the payload size.
const CELL_COST: usize = 16;

/// Two-space copying collector (Cheney style).
///
/// Values live in the current space, a flat `Vec` of cells addressed by
/// [`ValueRef`] index. Allocation is an append plus a logical byte charge.
/// A collection forwards every root into the spare space, rewriting the
/// root handles in place, then the spaces swap roles. Cell 0 of either
/// space is always the `none` singleton.
///
/// The byte budget is logical: appends never fail outright, but a live set
/// that still exceeds the capacity after a collection surfaces
/// `OutOfMemory` at the caller's next GC safe point.
pub struct Gc {
    heap: Vec<Value>,
    spare: Vec<Value>,
    used: usize,
    capacity: usize,
    /// from-space index -> to-space index for arrays, so that aliased and
    /// self-referential arrays forward to a single copy.
    forwards: HashMap<u32, u32>,
    collecting: bool,
}

fn cost(value: &Value) -> usize {
    CELL_COST
        + match value {
            Value::Str(s) => s.len(),
            Value::Array(slots) => slots.len() * 4,
            _ => 0,
        }
}

impl Gc {
    pub fn new() -> Self {
        Gc::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Gc {
            heap: vec![Value::None],
            spare: Vec::new(),
            used: CELL_COST,
            capacity,
            forwards: HashMap::new(),
            collecting: false,
        }
    }

    // -------------------------------------------------------------------------
    // allocation
    // -------------------------------------------------------------------------

    pub fn alloc(&mut self, value: Value) -> ValueRef {
        self.used += cost(&value);
        self.heap.push(value);
        ValueRef(self.heap.len() as u32 - 1)
    }

    pub fn new_int(&mut self, value: i32) -> ValueRef {
        self.alloc(Value::Int(value))
    }

    pub fn new_float(&mut self, value: f32) -> ValueRef {
        self.alloc(Value::Float(value))
    }

    pub fn new_string(&mut self, value: &str) -> ValueRef {
        self.alloc(Value::Str(value.to_string()))
    }

    /// Array slots start out as `none`.
    pub fn new_array(&mut self, len: usize) -> ValueRef {
        self.alloc(Value::Array(vec![NONE_REF; len]))
    }

    pub fn new_func(&mut self, pc: u32) -> ValueRef {
        self.alloc(Value::Func(pc))
    }

    pub fn new_syscall(&mut self, index: u32) -> ValueRef {
        self.alloc(Value::Syscall(index))
    }

    pub fn new_none(&mut self) -> ValueRef {
        NONE_REF
    }

    pub fn get(&self, r: ValueRef) -> &Value {
        &self.heap[r.0 as usize]
    }

    pub fn get_mut(&mut self, r: ValueRef) -> &mut Value {
        &mut self.heap[r.0 as usize]
    }

    /// Copy a value: scalars and strings deeply, arrays by reference.
    pub fn copy(&mut self, r: ValueRef) -> ValueRef {
        match self.get(r) {
            Value::None => NONE_REF,
            Value::Array(_) => r,
            other => {
                let clone = other.clone();
                self.alloc(clone)
            }
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn should_collect(&self) -> bool {
        self.used * 2 >= self.capacity
    }

    /// True when even a completed collection left more live data than the
    /// space can hold.
    pub fn over_budget(&self) -> bool {
        self.used >= self.capacity
    }

    // -------------------------------------------------------------------------
    // collection
    // -------------------------------------------------------------------------
    //
    // Protocol: begin_collect(), then forward_roots() once per root set
    // (value stack, globals, embedder roots), then end_collect(). Nothing
    // may allocate between begin and end.

    pub fn begin_collect(&mut self) {
        debug_assert!(!self.collecting);
        self.collecting = true;
        std::mem::swap(&mut self.heap, &mut self.spare);
        self.heap.clear();
        self.heap.push(Value::None);
        self.used = CELL_COST;
        self.forwards.clear();
    }

    pub fn forward_roots(&mut self, roots: &mut [ValueRef]) {
        debug_assert!(self.collecting);
        for root in roots {
            *root = self.forward(*root);
        }
    }

    pub fn end_collect(&mut self) {
        debug_assert!(self.collecting);
        self.collecting = false;
        self.spare.clear();
        self.forwards.clear();
    }

    fn forward(&mut self, r: ValueRef) -> ValueRef {
        if r == NONE_REF {
            return NONE_REF;
        }
        if let Some(&to) = self.forwards.get(&r.0) {
            return ValueRef(to);
        }
        match &self.spare[r.0 as usize] {
            Value::None => NONE_REF,
            Value::Array(slots) => {
                let kids = slots.clone();
                // reserve the copy and record the forward before tracing
                // children, so aliases and cycles land on this copy
                let to = self.alloc(Value::Array(vec![NONE_REF; kids.len()]));
                self.forwards.insert(r.0, to.0);
                for (i, kid) in kids.into_iter().enumerate() {
                    let moved = self.forward(kid);
                    if let Value::Array(slots) = self.get_mut(to) {
                        slots[i] = moved;
                    }
                }
                to
            }
            scalar => {
                let clone = scalar.clone();
                self.alloc(clone)
            }
        }
    }
}

impl Default for Gc {
    fn default() -> Self {
        Gc::new()
    }
}
