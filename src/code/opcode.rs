#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Add = 0x01,
    Mul = 0x02,
    Sub = 0x03,
    Div = 0x04,
    Mod = 0x06,
    Exp = 0x0a,
    Lt = 0x10,
    Gt = 0x11,
    Eq = 0x14,
    IsZero = 0x15,
    BitwiseAnd = 0x16,
    BitwiseOr = 0x17,
    BitwiseXor = 0x18,
    BitwiseNot = 0x19,
    Byte = 0x1a,
    ShiftLeft = 0x1b,
    ShiftRight = 0x1c,
    Hash = 0x20,
    Type = 0x21,
    Pop = 0x30,
    StaticPush = 0x31,
    RegisterPush = 0x32,
    RegisterSet = 0x33,
    Jump = 0x34,
    CJump = 0x35,
    StackEmpty = 0x36,
    PcPush = 0x37,
    AuxPush = 0x38,
    AuxPop = 0x39,
    AuxStackEmpty = 0x3a,
    Nop = 0x3b,
    ErrPush = 0x3c,
    ErrSet = 0x3d,
    Switch = 0x3e, // pop index A, table B -> jump to B[A]
    Dup0 = 0x40,
    Dup1 = 0x41,
    Dup2 = 0x42,
    Swap1 = 0x43,
    Swap2 = 0x44,
    TGet = 0x50,
    TSet = 0x51,
    TLen = 0x52,
    XGet = 0x53, // index into the tuple on top of the aux stack
    XSet = 0x54,
    Error = 0x73,
    Halt = 0x74,
    PushGas = 0x76,
    NewBuffer = 0xa0,
    GetBuffer8 = 0xa1,
    GetBuffer64 = 0xa2,
    GetBuffer256 = 0xa3,
    SetBuffer8 = 0xa4,
    SetBuffer64 = 0xa5,
    SetBuffer256 = 0xa6,
    RunWasm = 0xa7, // pop (buffer, len) -> push (buffer, len), gas_used
}

impl Opcode {
    /// Fixed gas charged before the opcode's effect. `RunWasm` adds the
    /// guest's consumption on top.
    pub fn base_gas(self) -> u64 {
        use Opcode::*;
        match self {
            Add | Mul | Sub => 3,
            Div | Mod => 4,
            Exp => 25,
            Lt | Gt | Eq | IsZero | BitwiseAnd | BitwiseOr | BitwiseXor => 2,
            BitwiseNot => 1,
            Byte | ShiftLeft | ShiftRight => 4,
            Hash => 7,
            Type => 3,
            Pop | StaticPush | RegisterPush => 1,
            RegisterSet => 2,
            Jump | CJump => 4,
            StackEmpty | AuxStackEmpty => 2,
            PcPush | AuxPush | AuxPop | Nop | ErrPush | ErrSet => 1,
            Switch => 6,
            Dup0 | Dup1 | Dup2 | Swap1 | Swap2 => 1,
            TGet | TLen => 2,
            TSet => 40,
            XGet => 3,
            XSet => 41,
            Error => 5,
            Halt => 10,
            PushGas => 1,
            NewBuffer => 1,
            GetBuffer8 | GetBuffer64 | GetBuffer256 => 10,
            SetBuffer8 | SetBuffer64 | SetBuffer256 => 100,
            RunWasm => 100,
        }
    }
}

/// Gas charged for a byte that names no opcode.
pub const UNKNOWN_OPCODE_GAS: u64 = 5;

impl TryFrom<u8> for Opcode {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, ()> {
        use Opcode::*;
        Ok(match v {
            0x01 => Add,
            0x02 => Mul,
            0x03 => Sub,
            0x04 => Div,
            0x06 => Mod,
            0x0a => Exp,
            0x10 => Lt,
            0x11 => Gt,
            0x14 => Eq,
            0x15 => IsZero,
            0x16 => BitwiseAnd,
            0x17 => BitwiseOr,
            0x18 => BitwiseXor,
            0x19 => BitwiseNot,
            0x1a => Byte,
            0x1b => ShiftLeft,
            0x1c => ShiftRight,
            0x20 => Hash,
            0x21 => Type,
            0x30 => Pop,
            0x31 => StaticPush,
            0x32 => RegisterPush,
            0x33 => RegisterSet,
            0x34 => Jump,
            0x35 => CJump,
            0x36 => StackEmpty,
            0x37 => PcPush,
            0x38 => AuxPush,
            0x39 => AuxPop,
            0x3a => AuxStackEmpty,
            0x3b => Nop,
            0x3c => ErrPush,
            0x3d => ErrSet,
            0x3e => Switch,
            0x40 => Dup0,
            0x41 => Dup1,
            0x42 => Dup2,
            0x43 => Swap1,
            0x44 => Swap2,
            0x50 => TGet,
            0x51 => TSet,
            0x52 => TLen,
            0x53 => XGet,
            0x54 => XSet,
            0x73 => Error,
            0x74 => Halt,
            0x76 => PushGas,
            0xa0 => NewBuffer,
            0xa1 => GetBuffer8,
            0xa2 => GetBuffer64,
            0xa3 => GetBuffer256,
            0xa4 => SetBuffer8,
            0xa5 => SetBuffer64,
            0xa6 => SetBuffer256,
            0xa7 => RunWasm,
            _ => return Err(()),
        })
    }
}
