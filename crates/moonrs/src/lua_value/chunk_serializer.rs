// Binary chunk writer/loader. The layout is the reference 5.3 format:
// signature, version/format bytes, a fixed data token that catches
// transcoding corruption, size tags, two test values, then the prototype
// tree with tagged constants and the debug tables.

use std::rc::Rc;

use crate::lua_value::{LocVar, Proto, UpvalDesc, Value};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub const BINARY_SIGNATURE: [u8; 4] = *b"\x1bLua";
const VERSION: u8 = 0x53;
const FORMAT: u8 = 0;
const DATA_TOKEN: [u8; 6] = *b"\x19\x93\r\n\x1a\n";
const TEST_INT: i64 = 0x5678;
const TEST_NUM: f64 = 370.5;

// Constant tags: basic type in the low nibble, variant in the high one.
const TAG_NIL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_NUMFLT: u8 = 0x03;
const TAG_NUMINT: u8 = 0x13;
const TAG_SHRSTR: u8 = 0x04;
const TAG_LNGSTR: u8 = 0x14;

// ===== Dumping =====

struct Dumper<'a> {
    vm: &'a LuaVM,
    out: Vec<u8>,
}

impl<'a> Dumper<'a> {
    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn int(&mut self, i: u32) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    fn integer(&mut self, i: i64) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    fn number(&mut self, n: f64) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn size(&mut self, s: usize) {
        self.out.extend_from_slice(&(s as u64).to_le_bytes());
    }

    fn string(&mut self, s: Option<&[u8]>) {
        match s {
            None => self.byte(0),
            Some(bytes) => {
                let n = bytes.len() + 1;
                if n < 0xFF {
                    self.byte(n as u8);
                } else {
                    self.byte(0xFF);
                    self.size(n);
                }
                self.out.extend_from_slice(bytes);
            }
        }
    }

    fn str_id(&mut self, id: Option<crate::gc::StrId>) {
        match id {
            None => self.string(None),
            Some(id) => {
                let bytes = self.vm_string_bytes(id);
                self.string(Some(&bytes));
            }
        }
    }

    fn vm_string_bytes(&self, id: crate::gc::StrId) -> Vec<u8> {
        self.vm.pool.string(id).as_bytes().to_vec()
    }

    fn header(&mut self) {
        self.out.extend_from_slice(&BINARY_SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        self.out.extend_from_slice(&DATA_TOKEN);
        self.byte(4); // int
        self.byte(8); // size_t
        self.byte(4); // Instruction
        self.byte(8); // integer
        self.byte(8); // float
        self.integer(TEST_INT);
        self.number(TEST_NUM);
    }

    fn function(&mut self, p: &Proto) {
        self.str_id(p.source);
        self.int(p.linedefined);
        self.int(p.lastlinedefined);
        self.byte(p.numparams);
        self.byte(p.is_vararg as u8);
        self.byte(p.maxstacksize);
        self.int(p.code.len() as u32);
        for &i in &p.code {
            self.int(i);
        }
        self.int(p.constants.len() as u32);
        for k in &p.constants {
            match k {
                Value::Nil => self.byte(TAG_NIL),
                Value::Bool(b) => {
                    self.byte(TAG_BOOL);
                    self.byte(*b as u8);
                }
                Value::Float(f) => {
                    self.byte(TAG_NUMFLT);
                    self.number(*f);
                }
                Value::Int(i) => {
                    self.byte(TAG_NUMINT);
                    self.integer(*i);
                }
                Value::Str(id) => {
                    let bytes = self.vm_string_bytes(*id);
                    if self.vm.pool.string(*id).is_short() {
                        self.byte(TAG_SHRSTR);
                    } else {
                        self.byte(TAG_LNGSTR);
                    }
                    self.string(Some(&bytes));
                }
                other => {
                    debug_assert!(false, "non-dumpable constant {:?}", other);
                    self.byte(TAG_NIL);
                }
            }
        }
        self.int(p.upvalues.len() as u32);
        for uv in &p.upvalues {
            self.byte(uv.in_stack as u8);
            self.byte(uv.idx);
        }
        self.int(p.protos.len() as u32);
        for nested in &p.protos {
            self.function(nested);
        }
        // Debug section.
        self.int(p.lineinfo.len() as u32);
        for &l in &p.lineinfo {
            self.int(l);
        }
        self.int(p.locvars.len() as u32);
        for lv in &p.locvars {
            self.str_id(Some(lv.name));
            self.int(lv.start_pc);
            self.int(lv.end_pc);
        }
        self.int(p.upvalues.len() as u32);
        for uv in &p.upvalues {
            self.str_id(uv.name);
        }
    }
}

pub fn dump_proto(vm: &LuaVM, proto: &Proto) -> Vec<u8> {
    let mut d = Dumper {
        vm,
        out: Vec::with_capacity(256),
    };
    d.header();
    d.byte(proto.upvalues.len() as u8);
    d.function(proto);
    d.out
}

// ===== Loading =====

struct Undumper<'a, 'v> {
    vm: &'v mut LuaVM,
    data: &'a [u8],
    pos: usize,
}

impl<'a, 'v> Undumper<'a, 'v> {
    fn fail(&mut self, what: &str) -> LuaError {
        let msg = format!("binary chunk: {}", what);
        self.vm.set_error_string(&msg);
        LuaError::SyntaxError
    }

    fn byte(&mut self) -> LuaResult<u8> {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(self.fail("truncated")),
        }
    }

    fn bytes(&mut self, n: usize) -> LuaResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(self.fail("truncated"));
        }
        let whole: &'a [u8] = self.data;
        let s = &whole[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn int(&mut self) -> LuaResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn integer(&mut self) -> LuaResult<i64> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn number(&mut self) -> LuaResult<f64> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn size(&mut self) -> LuaResult<usize> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")) as usize)
    }

    fn string(&mut self) -> LuaResult<Option<crate::gc::StrId>> {
        let mut n = self.byte()? as usize;
        if n == 0xFF {
            n = self.size()?;
        }
        if n == 0 {
            return Ok(None);
        }
        let content = self.bytes(n - 1)?.to_vec();
        Ok(Some(self.vm.intern_bytes(&content)))
    }

    fn header(&mut self) -> LuaResult<()> {
        if self.bytes(4)? != BINARY_SIGNATURE {
            return Err(self.fail("bad signature"));
        }
        if self.byte()? != VERSION {
            return Err(self.fail("version mismatch"));
        }
        if self.byte()? != FORMAT {
            return Err(self.fail("format mismatch"));
        }
        if self.bytes(6)? != DATA_TOKEN {
            return Err(self.fail("corrupted"));
        }
        for expected in [4u8, 8, 4, 8, 8] {
            if self.byte()? != expected {
                return Err(self.fail("size mismatch"));
            }
        }
        if self.integer()? != TEST_INT {
            return Err(self.fail("endianness mismatch"));
        }
        if self.number()? != TEST_NUM {
            return Err(self.fail("float format mismatch"));
        }
        Ok(())
    }

    fn function(&mut self) -> LuaResult<Proto> {
        let mut p = Proto::new();
        p.source = self.string()?;
        p.linedefined = self.int()?;
        p.lastlinedefined = self.int()?;
        p.numparams = self.byte()?;
        p.is_vararg = self.byte()? != 0;
        p.maxstacksize = self.byte()?;
        let ncode = self.int()? as usize;
        p.code.reserve(ncode);
        for _ in 0..ncode {
            p.code.push(self.int()?);
        }
        let nk = self.int()? as usize;
        for _ in 0..nk {
            let tag = self.byte()?;
            let k = match tag {
                TAG_NIL => Value::Nil,
                TAG_BOOL => Value::Bool(self.byte()? != 0),
                TAG_NUMFLT => Value::Float(self.number()?),
                TAG_NUMINT => Value::Int(self.integer()?),
                TAG_SHRSTR | TAG_LNGSTR => match self.string()? {
                    Some(id) => Value::Str(id),
                    None => return Err(self.fail("bad string constant")),
                },
                _ => return Err(self.fail("bad constant tag")),
            };
            p.constants.push(k);
        }
        let nup = self.int()? as usize;
        for _ in 0..nup {
            let in_stack = self.byte()? != 0;
            let idx = self.byte()?;
            p.upvalues.push(UpvalDesc {
                name: None,
                in_stack,
                idx,
            });
        }
        let np = self.int()? as usize;
        for _ in 0..np {
            p.protos.push(Rc::new(self.function()?));
        }
        let nlines = self.int()? as usize;
        for _ in 0..nlines {
            p.lineinfo.push(self.int()?);
        }
        let nloc = self.int()? as usize;
        for _ in 0..nloc {
            let name = self.string()?;
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            if let Some(name) = name {
                p.locvars.push(LocVar {
                    name,
                    start_pc,
                    end_pc,
                });
            }
        }
        let nupnames = self.int()? as usize;
        for i in 0..nupnames {
            let name = self.string()?;
            if let Some(uv) = p.upvalues.get_mut(i) {
                uv.name = name;
            }
        }
        Ok(p)
    }
}

pub fn undump_proto(vm: &mut LuaVM, data: &[u8]) -> LuaResult<Proto> {
    let mut u = Undumper { vm, data, pos: 0 };
    u.header()?;
    let _nupvals = u.byte()?;
    u.function()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::{LuaVM, VmOptions};

    #[test]
    fn test_header_roundtrip() {
        let mut vm = LuaVM::new(VmOptions::default());
        let proto = Proto::new();
        let bytes = dump_proto(&vm, &proto);
        assert_eq!(&bytes[..4], &BINARY_SIGNATURE);
        let back = undump_proto(&mut vm, &bytes).expect("undump");
        assert_eq!(back.numparams, proto.numparams);
        assert_eq!(back.code.len(), 0);
    }

    #[test]
    fn test_rejects_corrupt_header() {
        let mut vm = LuaVM::new(VmOptions::default());
        let proto = Proto::new();
        let mut bytes = dump_proto(&vm, &proto);
        bytes[8] ^= 0x40; // flip a bit inside the data token
        assert!(undump_proto(&mut vm, &bytes).is_err());
    }
}
