//! Class-file constants: magic, supported versions, constant pool tags and the
//! opcode facts needed to walk a method's instruction stream.

pub const JAVA_MAGIC: u32 = 0xCAFE_BABE;

pub const JAVA_MIN_MAJOR_VERSION: u16 = 45;
pub const JAVA_MIN_MINOR_VERSION: u16 = 3;
pub const JAVA_MAX_MAJOR_VERSION: u16 = 69;

/// Majors accepted even when they fall outside the min/max window.
pub const JAVA_EXTRA_MAJOR_VERSIONS: [u16; 3] = [49, 50, 51];

pub fn is_supported_version(major: u16, minor: u16) -> bool {
    let combined = u32::from(major) * 1000 + u32::from(minor);
    let min = u32::from(JAVA_MIN_MAJOR_VERSION) * 1000 + u32::from(JAVA_MIN_MINOR_VERSION);
    if major <= JAVA_MAX_MAJOR_VERSION && combined >= min {
        return true;
    }
    JAVA_EXTRA_MAJOR_VERSIONS.contains(&major)
}

pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

pub const OPC_ILOAD: u8 = 0x15;
pub const OPC_ALOAD: u8 = 0x19;
pub const OPC_ISTORE: u8 = 0x36;
pub const OPC_ASTORE: u8 = 0x3a;
pub const OPC_IINC: u8 = 0x84;
pub const OPC_GOTO: u8 = 0xa7;
pub const OPC_RET: u8 = 0xa9;
pub const OPC_TABLESWITCH: u8 = 0xaa;
pub const OPC_LOOKUPSWITCH: u8 = 0xab;
pub const OPC_IRETURN: u8 = 0xac;
pub const OPC_RETURN: u8 = 0xb1;
pub const OPC_WIDE: u8 = 0xc4;
pub const OPC_GOTO_W: u8 = 0xc8;

/// Fixed length of an instruction, or 0 for the variable-length ones
/// (`tableswitch`, `lookupswitch`, `wide`).
pub const fn instruction_length(opcode: u8) -> usize {
    match opcode {
        0x10 | 0x12 | 0x15..=0x19 | 0x36..=0x3a | 0xa9 | 0xbc => 2,
        0x11 | 0x13 | 0x14 | 0x84 | 0x99..=0xa8 | 0xb2..=0xb8 | 0xbb | 0xbd | 0xc0 | 0xc1
        | 0xc6 | 0xc7 => 3,
        0xc5 => 4,
        0xb9 | 0xba | 0xc8 | 0xc9 => 5,
        OPC_TABLESWITCH | OPC_LOOKUPSWITCH | OPC_WIDE => 0,
        _ => 1,
    }
}

pub const fn is_return(opcode: u8) -> bool {
    opcode >= OPC_IRETURN && opcode <= OPC_RETURN
}

pub const fn is_goto(opcode: u8) -> bool {
    opcode == OPC_GOTO || opcode == OPC_GOTO_W
}
