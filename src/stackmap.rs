//! Decoding and patching of `StackMapTable` frames.
//!
//! Frames are delta encoded: the first frame sits at `delta`, every later one at
//! `previous + delta + 1`. When bytecode is inserted, only the first frame past the
//! edit needs its delta bumped for every following absolute offset to stay right.

use crate::error::{ClassError, Result};
use crate::layout::be_u16;

const SAME_MAX: u8 = 63;
const SAME_LOCALS_1_BASE: u8 = 64;
const SAME_LOCALS_1_MAX: u8 = 127;
const SAME_LOCALS_1_EXTENDED: u8 = 247;
const CHOP_MIN: u8 = 248;
const CHOP_MAX: u8 = 250;
const SAME_EXTENDED: u8 = 251;
const APPEND_MIN: u8 = 252;
const APPEND_MAX: u8 = 254;
const FULL_FRAME: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of the class.
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

impl VerificationType {
    fn decode(buf: &[u8], pos: &mut usize) -> Option<Self> {
        let tag = *buf.get(*pos)?;
        *pos += 1;
        let v = match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 | 8 => {
                let idx = be_u16(buf, *pos)?;
                *pos += 2;
                if tag == 7 {
                    VerificationType::Object(idx)
                } else {
                    VerificationType::Uninitialized(idx)
                }
            }
            _ => return None,
        };
        Some(v)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            VerificationType::Top => out.push(0),
            VerificationType::Integer => out.push(1),
            VerificationType::Float => out.push(2),
            VerificationType::Double => out.push(3),
            VerificationType::Long => out.push(4),
            VerificationType::Null => out.push(5),
            VerificationType::UninitializedThis => out.push(6),
            VerificationType::Object(idx) => {
                out.push(7);
                out.extend_from_slice(&idx.to_be_bytes());
            }
            VerificationType::Uninitialized(ofs) => {
                out.push(8);
                out.extend_from_slice(&ofs.to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same {
        delta: u16,
        extended: bool,
    },
    SameLocals1 {
        delta: u16,
        stack: VerificationType,
        extended: bool,
    },
    Chop {
        delta: u16,
        chopped: u8,
    },
    Append {
        delta: u16,
        locals: Vec<VerificationType>,
    },
    Full {
        delta: u16,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

impl StackMapFrame {
    pub fn delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { delta, .. }
            | StackMapFrame::SameLocals1 { delta, .. }
            | StackMapFrame::Chop { delta, .. }
            | StackMapFrame::Append { delta, .. }
            | StackMapFrame::Full { delta, .. } => *delta,
        }
    }

    fn set_delta(&mut self, new_delta: u16) {
        match self {
            StackMapFrame::Same { delta, extended } | StackMapFrame::SameLocals1 { delta, extended, .. } => {
                *delta = new_delta;
                if new_delta > u16::from(SAME_MAX) {
                    *extended = true;
                }
            }
            StackMapFrame::Chop { delta, .. }
            | StackMapFrame::Append { delta, .. }
            | StackMapFrame::Full { delta, .. } => *delta = new_delta,
        }
    }

    fn types_mut(&mut self) -> Box<dyn Iterator<Item = &mut VerificationType> + '_> {
        match self {
            StackMapFrame::Same { .. } | StackMapFrame::Chop { .. } => Box::new(std::iter::empty()),
            StackMapFrame::SameLocals1 { stack, .. } => Box::new(std::iter::once(stack)),
            StackMapFrame::Append { locals, .. } => Box::new(locals.iter_mut()),
            StackMapFrame::Full { locals, stack, .. } => Box::new(locals.iter_mut().chain(stack.iter_mut())),
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Option<Self> {
        let tag = *buf.get(*pos)?;
        *pos += 1;
        let u2 = |pos: &mut usize| -> Option<u16> {
            let v = be_u16(buf, *pos)?;
            *pos += 2;
            Some(v)
        };

        let frame = match tag {
            0..=SAME_MAX => StackMapFrame::Same {
                delta: u16::from(tag),
                extended: false,
            },
            SAME_LOCALS_1_BASE..=SAME_LOCALS_1_MAX => StackMapFrame::SameLocals1 {
                delta: u16::from(tag - SAME_LOCALS_1_BASE),
                stack: VerificationType::decode(buf, pos)?,
                extended: false,
            },
            SAME_LOCALS_1_EXTENDED => {
                let delta = u2(pos)?;
                StackMapFrame::SameLocals1 {
                    delta,
                    stack: VerificationType::decode(buf, pos)?,
                    extended: true,
                }
            }
            CHOP_MIN..=CHOP_MAX => StackMapFrame::Chop {
                delta: u2(pos)?,
                chopped: SAME_EXTENDED - tag,
            },
            SAME_EXTENDED => StackMapFrame::Same {
                delta: u2(pos)?,
                extended: true,
            },
            APPEND_MIN..=APPEND_MAX => {
                let delta = u2(pos)?;
                let locals = (0..tag - SAME_EXTENDED)
                    .map(|_| VerificationType::decode(buf, pos))
                    .collect::<Option<Vec<_>>>()?;
                StackMapFrame::Append { delta, locals }
            }
            FULL_FRAME => {
                let delta = u2(pos)?;
                let n = u2(pos)?;
                let locals = (0..n)
                    .map(|_| VerificationType::decode(buf, pos))
                    .collect::<Option<Vec<_>>>()?;
                let n = u2(pos)?;
                let stack = (0..n)
                    .map(|_| VerificationType::decode(buf, pos))
                    .collect::<Option<Vec<_>>>()?;
                StackMapFrame::Full { delta, locals, stack }
            }
            _ => return None,
        };
        Some(frame)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            StackMapFrame::Same { delta, extended } => {
                if *extended || *delta > u16::from(SAME_MAX) {
                    out.push(SAME_EXTENDED);
                    out.extend_from_slice(&delta.to_be_bytes());
                } else {
                    out.push(*delta as u8);
                }
            }
            StackMapFrame::SameLocals1 { delta, stack, extended } => {
                if *extended || *delta > u16::from(SAME_MAX) {
                    out.push(SAME_LOCALS_1_EXTENDED);
                    out.extend_from_slice(&delta.to_be_bytes());
                } else {
                    out.push(SAME_LOCALS_1_BASE + *delta as u8);
                }
                stack.encode(out);
            }
            StackMapFrame::Chop { delta, chopped } => {
                out.push(SAME_EXTENDED - chopped);
                out.extend_from_slice(&delta.to_be_bytes());
            }
            StackMapFrame::Append { delta, locals } => {
                out.push(SAME_EXTENDED + locals.len() as u8);
                out.extend_from_slice(&delta.to_be_bytes());
                locals.iter().for_each(|v| v.encode(out));
            }
            StackMapFrame::Full { delta, locals, stack } => {
                out.push(FULL_FRAME);
                out.extend_from_slice(&delta.to_be_bytes());
                out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
                locals.iter().for_each(|v| v.encode(out));
                out.extend_from_slice(&(stack.len() as u16).to_be_bytes());
                stack.iter().for_each(|v| v.encode(out));
            }
        }
    }
}

/// What kind of bytecode edit happened at the injection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// New instructions were inserted at the position.
    InsertInstruction,
    /// The instruction at the position grew (e.g. `goto` became `goto_w`).
    WidenInstruction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMapPatcher {
    frames: Vec<StackMapFrame>,
}

impl StackMapPatcher {
    pub fn new(frames: Vec<StackMapFrame>) -> Self {
        Self { frames }
    }

    /// `table` is the attribute body: the entry count followed by the frames.
    pub fn decode(class: &str, table: &[u8]) -> Result<Self> {
        let bad = |pos: usize| ClassError::format(class, pos, "malformed StackMapTable");
        let count = be_u16(table, 0).ok_or_else(|| bad(0))?;
        let mut pos = 2;
        let mut frames = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let start = pos;
            frames.push(StackMapFrame::decode(table, &mut pos).ok_or_else(|| bad(start))?);
        }
        Ok(Self { frames })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.frames.len() as u16).to_be_bytes());
        for f in &self.frames {
            f.encode(&mut out);
        }
        out
    }

    pub fn frames(&self) -> &[StackMapFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn absolute_offsets(&self) -> Vec<u32> {
        let mut res = Vec::with_capacity(self.frames.len());
        let mut prev: Option<u32> = None;
        for f in &self.frames {
            let abs = match prev {
                None => u32::from(f.delta()),
                Some(p) => p + u32::from(f.delta()) + 1,
            };
            res.push(abs);
            prev = Some(abs);
        }
        res
    }

    /// Accounts for `count` bytes injected at bytecode offset `pos`. Returns whether
    /// anything changed.
    ///
    /// For an insertion, a frame recorded exactly at `pos` moves with the old
    /// instruction unless the new code binds to the following instruction; a widened
    /// instruction never moves the frame at its own offset.
    pub fn update_table(
        &mut self,
        pos: u32,
        count: u32,
        kind: EditKind,
        binds_to_following: bool,
    ) -> Result<bool> {
        if count == 0 {
            return Ok(false);
        }
        let mut changed = false;

        let affected = self.absolute_offsets().into_iter().position(|abs| match kind {
            EditKind::InsertInstruction => abs > pos || (abs == pos && !binds_to_following),
            EditKind::WidenInstruction => abs > pos,
        });
        if let Some(i) = affected {
            let frame = &mut self.frames[i];
            let new_delta = u32::from(frame.delta()) + count;
            let new_delta = u16::try_from(new_delta).map_err(|_| ClassError::BadLocation {
                message: format!("stack map frame delta {new_delta} exceeds 65535"),
            })?;
            frame.set_delta(new_delta);
            changed = true;
        }

        for frame in &mut self.frames {
            for vt in frame.types_mut() {
                if let VerificationType::Uninitialized(ofs) = vt {
                    let at = u32::from(*ofs);
                    let moves = match kind {
                        EditKind::InsertInstruction => at >= pos,
                        EditKind::WidenInstruction => at > pos,
                    };
                    if moves {
                        *ofs = u16::try_from(at + count).map_err(|_| ClassError::BadLocation {
                            message: format!("uninitialized offset {} exceeds 65535", at + count),
                        })?;
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Appends a full frame at absolute offset `at`, which must follow the last frame.
    pub fn add_full_frame(
        &mut self,
        at: u32,
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    ) -> Result<()> {
        let delta = match self.absolute_offsets().last() {
            None => at,
            Some(&last) if at > last => at - last - 1,
            Some(&last) => {
                return Err(ClassError::BadLocation {
                    message: format!("new frame at {at} does not follow last frame at {last}"),
                });
            }
        };
        let delta = u16::try_from(delta).map_err(|_| ClassError::BadLocation {
            message: format!("stack map frame delta {delta} exceeds 65535"),
        })?;
        self.frames.push(StackMapFrame::Full { delta, locals, stack });
        Ok(())
    }
}
