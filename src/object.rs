// File: src/object.rs
//
// Heap objects for the Curd VM.
// All objects live in an owning arena (`Heap`) and are addressed by small
// Copy handles. Nothing is freed individually; the arena drops wholesale
// when the VM does. The arena also owns the string interner, so any two
// strings with the same content share one handle.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Index of an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjHandle(u32);

impl ObjHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Host function signature. Natives receive the argument window of the
/// operand stack and produce a value; there is no failure channel.
pub type NativeFn = fn(&[Value]) -> Value;

/// An interned, immutable string with its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct ObjStr {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function: parameter count, its bytecode chunk, and an
/// optional name (None for the top-level script).
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub chunk: Chunk,
    pub name: Option<ObjHandle>,
}

/// A function paired with the upvalues it closed over, one per descriptor
/// the compiler emitted.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

/// A captured variable. Open upvalues point at a live operand-stack slot;
/// closing moves the slot's last value into the upvalue itself.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

/// A host-provided function. Arity -1 means variadic (no check).
#[derive(Debug)]
pub struct ObjNative {
    pub arity: i32,
    pub name: ObjHandle,
    pub fun: NativeFn,
}

#[derive(Debug)]
pub enum Obj {
    Str(ObjStr),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
}

/// FNV-1a over the raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Fetch a string object out of a raw arena slice. The table uses this to
/// probe without borrowing the whole heap.
pub(crate) fn string_of(objects: &[Obj], handle: ObjHandle) -> &ObjStr {
    match &objects[handle.index()] {
        Obj::Str(s) => s,
        other => panic!("handle does not refer to a string: {:?}", other),
    }
}

/// The object arena plus the string interner.
pub struct Heap {
    objects: Vec<Obj>,
    strings: Table,
}

impl Heap {
    pub fn new() -> Heap {
        Heap { objects: Vec::new(), strings: Table::new() }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjHandle {
        self.objects.push(obj);
        ObjHandle((self.objects.len() - 1) as u32)
    }

    pub fn objects(&self) -> &[Obj] {
        &self.objects
    }

    pub fn get(&self, handle: ObjHandle) -> &Obj {
        &self.objects[handle.index()]
    }

    /// Intern a string: return the existing handle for equal content, or
    /// allocate, register and return a fresh one. Every string that could
    /// end up as a table key must pass through here first.
    pub fn intern(&mut self, chars: &str) -> ObjHandle {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.objects, chars, hash) {
            return existing;
        }
        let handle = self.alloc(Obj::Str(ObjStr { chars: chars.to_string(), hash }));
        self.strings.set(&self.objects, handle, Value::Nil);
        handle
    }

    /// Look up an already-interned string without inserting.
    pub fn find_interned(&self, chars: &str) -> Option<ObjHandle> {
        let hash = hash_bytes(chars.as_bytes());
        self.strings.find_string(&self.objects, chars, hash)
    }

    pub fn string(&self, handle: ObjHandle) -> &ObjStr {
        string_of(&self.objects, handle)
    }

    pub fn is_string(&self, handle: ObjHandle) -> bool {
        matches!(self.objects[handle.index()], Obj::Str(_))
    }

    pub fn function(&self, handle: ObjHandle) -> &ObjFunction {
        match &self.objects[handle.index()] {
            Obj::Function(f) => f,
            other => panic!("handle does not refer to a function: {:?}", other),
        }
    }

    pub fn closure(&self, handle: ObjHandle) -> &ObjClosure {
        match &self.objects[handle.index()] {
            Obj::Closure(c) => c,
            other => panic!("handle does not refer to a closure: {:?}", other),
        }
    }

    pub fn upvalue(&self, handle: ObjHandle) -> &ObjUpvalue {
        match &self.objects[handle.index()] {
            Obj::Upvalue(u) => u,
            other => panic!("handle does not refer to an upvalue: {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, handle: ObjHandle) -> &mut ObjUpvalue {
        match &mut self.objects[handle.index()] {
            Obj::Upvalue(u) => u,
            other => panic!("handle does not refer to an upvalue: {:?}", other),
        }
    }

    pub fn native(&self, handle: ObjHandle) -> &ObjNative {
        match &self.objects[handle.index()] {
            Obj::Native(n) => n,
            other => panic!("handle does not refer to a native: {:?}", other),
        }
    }

    /// Human-readable rendering, the `print` statement's view of a value.
    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(handle) => match self.get(handle) {
                Obj::Str(s) => s.chars.clone(),
                Obj::Function(f) => format!("function {}", self.function_label(f)),
                Obj::Closure(c) => {
                    format!("function {}", self.function_label(self.function(c.function)))
                }
                Obj::Native(n) => format!("native function {}", self.string(n.name).chars),
                Obj::Upvalue(_) => "upvalue".to_string(),
            },
        }
    }

    pub fn function_label(&self, function: &ObjFunction) -> &str {
        match function.name {
            Some(name) => &self.string(name).chars,
            None => "script",
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

/// Print a number the way `%g` would for the values the language deals in:
/// integral doubles lose the fractional part, everything else uses the
/// shortest round-trip form.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e16 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
