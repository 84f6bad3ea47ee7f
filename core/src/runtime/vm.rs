use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::code::{CO_NEWLOCALS, CodeUnit};
use crate::ir::{INSTR_WIDTH, Opcode};
use crate::patch::Function;

use super::context::VmContext;
use super::value::Value;

const MAX_DEPTH: usize = 200;

/// Stack interpreter for [`CodeUnit`] payloads.
///
/// Executes straight from the encoded bytes, so whatever a patch installed is
/// exactly what runs.
pub struct Vm {
    depth: usize,
}

impl Vm {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Runs a unit with no arguments. Units without `CO_NEWLOCALS` run at
    /// module level: their name stores land in the context's globals.
    pub fn exec(&mut self, code: &CodeUnit, ctx: &mut VmContext) -> Result<Value> {
        let locals = vec![None; code.tables.locals.len()];
        self.run(code, locals, ctx)
    }

    /// Calls a function with positional arguments.
    pub fn exec_with(&mut self, func: &Function, ctx: &mut VmContext, args: Option<&[Value]>) -> Result<Value> {
        self.call_function(func, args.unwrap_or(&[]), ctx)
    }

    fn call_function(&mut self, func: &Function, args: &[Value], ctx: &mut VmContext) -> Result<Value> {
        let code = func.code();
        let argcount = code.argcount as usize;
        let required = argcount.saturating_sub(func.defaults.len());
        ensure!(
            (required..=argcount).contains(&args.len()),
            "{}() takes {} positional arguments but {} were given",
            func.name,
            argcount,
            args.len()
        );
        let mut locals: Vec<Option<Value>> = vec![None; code.tables.locals.len().max(argcount)];
        for (slot, value) in args.iter().enumerate() {
            locals[slot] = Some(value.clone());
        }
        let missing = argcount - args.len();
        let defaults = &func.defaults[func.defaults.len() - missing..];
        for (offset, value) in defaults.iter().enumerate() {
            locals[args.len() + offset] = Some(Value::from(value));
        }
        self.run(code, locals, ctx)
    }

    fn call(&mut self, callee: &Value, args: &[Value], ctx: &mut VmContext) -> Result<Value> {
        match callee {
            Value::Builtin(builtin) => (builtin.func)(ctx, args),
            Value::Function(func) => self.call_function(func, args, ctx),
            other => bail!("'{}' object is not callable", other.type_name()),
        }
    }

    fn run(&mut self, code: &CodeUnit, locals: Vec<Option<Value>>, ctx: &mut VmContext) -> Result<Value> {
        ensure!(self.depth < MAX_DEPTH, "maximum recursion depth exceeded in {}", code.name);
        self.depth += 1;
        let mut frame = Frame {
            code,
            stack: Vec::with_capacity(code.stacksize as usize),
            locals,
            names: FxHashMap::default(),
            blocks: Vec::new(),
            pc: 0,
        };
        let result = self.run_frame(&mut frame, ctx);
        self.depth -= 1;
        result.with_context(|| format!("in {} at byte {}", code.name, frame.pc))
    }

    fn run_frame(&mut self, frame: &mut Frame<'_>, ctx: &mut VmContext) -> Result<Value> {
        let code = frame.code;
        let module_level = code.flags & CO_NEWLOCALS == 0;
        while frame.pc + 1 < code.code.len() {
            let pos = frame.pc;
            let byte = code.code[pos];
            let arg = code.code[pos + 1];
            let op = Opcode::from_byte(byte).ok_or_else(|| anyhow!("unknown opcode {}", byte))?;
            trace!(target: "bytepatch::vm", pos, %op, arg, depth = frame.stack.len(), "step");
            frame.pc += INSTR_WIDTH;

            match op {
                Opcode::Nop => {}
                Opcode::PopTop => {
                    frame.pop()?;
                }
                Opcode::LoadConst => {
                    let value = code
                        .tables
                        .consts
                        .get(arg as usize)
                        .ok_or_else(|| anyhow!("constant index {} out of range", arg))?;
                    frame.stack.push(Value::from(value));
                }
                Opcode::LoadFast => {
                    let value = frame
                        .locals
                        .get(arg as usize)
                        .cloned()
                        .flatten()
                        .ok_or_else(|| anyhow!("local variable '{}' referenced before assignment", frame.local_name(arg)))?;
                    frame.stack.push(value);
                }
                Opcode::StoreFast => {
                    let value = frame.pop()?;
                    let slot = frame
                        .locals
                        .get_mut(arg as usize)
                        .ok_or_else(|| anyhow!("local slot {} out of range", arg))?;
                    *slot = Some(value);
                }
                Opcode::LoadName => {
                    let name = frame.name(arg)?;
                    let value = frame
                        .names
                        .get(&name)
                        .or_else(|| ctx.get(&name))
                        .cloned()
                        .ok_or_else(|| anyhow!("name '{}' is not defined", name))?;
                    frame.stack.push(value);
                }
                Opcode::StoreName => {
                    let name = frame.name(arg)?;
                    let value = frame.pop()?;
                    if module_level {
                        ctx.set(&name, value);
                    } else {
                        frame.names.insert(name, value);
                    }
                }
                Opcode::LoadGlobal => {
                    let name = frame.name(arg)?;
                    let value = ctx.get(&name).cloned().ok_or_else(|| anyhow!("name '{}' is not defined", name))?;
                    frame.stack.push(value);
                }
                Opcode::BinaryPower
                | Opcode::BinaryMultiply
                | Opcode::BinaryModulo
                | Opcode::BinaryAdd
                | Opcode::BinarySubtract
                | Opcode::BinaryFloorDivide
                | Opcode::BinaryTrueDivide => {
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    frame.stack.push(binary(op, &lhs, &rhs)?);
                }
                Opcode::CompareOp => {
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    frame.stack.push(Value::Bool(compare(arg, &lhs, &rhs)?));
                }
                Opcode::GetIter => {
                    let value = frame.pop()?;
                    frame.stack.push(Value::Iter(value.iter()?));
                }
                Opcode::ForIter => {
                    let next = match frame.stack.last_mut() {
                        Some(Value::Iter(it)) => it.advance(),
                        _ => bail!("FOR_ITER without an iterator on the stack"),
                    };
                    match next {
                        Some(value) => frame.stack.push(value),
                        None => {
                            frame.pop()?;
                            frame.pc += arg as usize;
                        }
                    }
                }
                Opcode::JumpForward => frame.pc += arg as usize,
                Opcode::JumpAbsolute => frame.pc = arg as usize,
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    let cond = frame.pop()?.is_truthy();
                    if cond == (op == Opcode::PopJumpIfTrue) {
                        frame.pc = arg as usize;
                    }
                }
                Opcode::SetupLoop => frame.blocks.push(frame.pc + arg as usize),
                Opcode::PopBlock => {
                    frame.blocks.pop().ok_or_else(|| anyhow!("POP_BLOCK with empty block stack"))?;
                }
                Opcode::ReturnValue => return frame.pop(),
                Opcode::CallFunction => {
                    let args = frame.pop_n(arg as usize)?;
                    let callee = frame.pop()?;
                    let result = self.call(&callee, &args, ctx)?;
                    frame.stack.push(result);
                }
                Opcode::MakeFunction => {
                    ensure!(arg & !0x01 == 0, "MAKE_FUNCTION flags {:#x} are not supported", arg);
                    let _qualname = frame.pop()?;
                    let body = match frame.pop()? {
                        Value::Code(body) => body,
                        other => bail!("MAKE_FUNCTION expects code, got {}", other.type_name()),
                    };
                    let defaults = if arg & 0x01 != 0 {
                        match frame.pop()? {
                            Value::Tuple(items) => items.iter().map(Value::to_const).collect::<Result<Vec<_>>>()?,
                            other => bail!("function defaults must be a tuple, got {}", other.type_name()),
                        }
                    } else {
                        Vec::new()
                    };
                    frame.stack.push(Value::Function(Arc::new(Function::from_arc(body, defaults))));
                }
                Opcode::ImportName | Opcode::BuildConstKeyMap | Opcode::LoadMethod | Opcode::CallMethod => {
                    bail!("{} is not supported by this runtime", op)
                }
            }
        }
        bail!("fell off the end of {} without RETURN_VALUE", code.name)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

struct Frame<'code> {
    code: &'code CodeUnit,
    stack: Vec<Value>,
    locals: Vec<Option<Value>>,
    names: FxHashMap<Arc<str>, Value>,
    // Loop exits pushed by SETUP_LOOP.
    blocks: Vec<usize>,
    pc: usize,
}

impl Frame<'_> {
    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("value stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        ensure!(n <= self.stack.len(), "value stack underflow");
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn name(&self, arg: u8) -> Result<Arc<str>> {
        self.code
            .tables
            .names
            .get(arg as usize)
            .cloned()
            .ok_or_else(|| anyhow!("name index {} out of range", arg))
    }

    fn local_name(&self, arg: u8) -> &str {
        self.code.tables.locals.get(arg as usize).map(|n| n.as_ref()).unwrap_or("?")
    }
}

fn binary(op: Opcode, lhs: &Value, rhs: &Value) -> Result<Value> {
    use Value::{Float, Int, Str, Tuple};
    let value = match (op, lhs, rhs) {
        (Opcode::BinaryAdd, Int(a), Int(b)) => Int(a.checked_add(*b).context("integer overflow")?),
        (Opcode::BinarySubtract, Int(a), Int(b)) => Int(a.checked_sub(*b).context("integer overflow")?),
        (Opcode::BinaryMultiply, Int(a), Int(b)) => Int(a.checked_mul(*b).context("integer overflow")?),
        (Opcode::BinaryFloorDivide | Opcode::BinaryModulo, Int(_), Int(0)) => {
            bail!("integer division or modulo by zero")
        }
        (Opcode::BinaryFloorDivide, Int(a), Int(b)) => {
            let q = a.checked_div(*b).context("integer overflow")?;
            let r = a.checked_rem(*b).context("integer overflow")?;
            Int(if r != 0 && (r < 0) != (*b < 0) { q - 1 } else { q })
        }
        (Opcode::BinaryModulo, Int(a), Int(b)) => {
            // i64::MIN % -1 is 0 mathematically; only the hardware op overflows.
            let r = a.checked_rem(*b).unwrap_or(0);
            Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r })
        }
        (Opcode::BinaryPower, Int(a), Int(b)) if *b >= 0 => {
            let exp = u32::try_from(*b).context("exponent too large")?;
            Int(a.checked_pow(exp).context("integer overflow")?)
        }
        (Opcode::BinaryAdd, Str(a), Str(b)) => Value::str(&format!("{}{}", a, b)),
        (Opcode::BinaryMultiply, Str(s), Int(n)) | (Opcode::BinaryMultiply, Int(n), Str(s)) => {
            Value::str(&s.repeat((*n).max(0) as usize))
        }
        (Opcode::BinaryAdd, Tuple(a), Tuple(b)) => Tuple(a.iter().chain(b.iter()).cloned().collect()),
        _ => {
            let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
                bail!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    op,
                    lhs.type_name(),
                    rhs.type_name()
                );
            };
            match op {
                Opcode::BinaryAdd => Float(a + b),
                Opcode::BinarySubtract => Float(a - b),
                Opcode::BinaryMultiply => Float(a * b),
                Opcode::BinaryPower => Float(a.powf(b)),
                Opcode::BinaryTrueDivide | Opcode::BinaryFloorDivide | Opcode::BinaryModulo if b == 0.0 => {
                    bail!("division by zero")
                }
                Opcode::BinaryTrueDivide => Float(a / b),
                Opcode::BinaryFloorDivide => Float((a / b).floor()),
                Opcode::BinaryModulo => Float(a - b * (a / b).floor()),
                _ => bail!("{} is not a binary operator", op),
            }
        }
    };
    Ok(value)
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

fn compare(kind: u8, lhs: &Value, rhs: &Value) -> Result<bool> {
    let ordering = || -> Result<std::cmp::Ordering> {
        match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => {
                let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
                    bail!("cannot order '{}' and '{}'", lhs.type_name(), rhs.type_name());
                };
                a.partial_cmp(&b).ok_or_else(|| anyhow!("unordered comparison"))
            }
        }
    };
    let contains = || -> Result<bool> {
        match rhs {
            Value::Tuple(items) => Ok(items.iter().any(|item| item == lhs)),
            Value::Str(hay) => match lhs {
                Value::Str(needle) => Ok(hay.contains(needle.as_ref())),
                other => bail!("'in <string>' requires string, not {}", other.type_name()),
            },
            other => bail!("argument of type '{}' is not iterable", other.type_name()),
        }
    };
    Ok(match kind {
        0 => ordering()?.is_lt(),
        1 => ordering()?.is_le(),
        2 => lhs == rhs,
        3 => lhs != rhs,
        4 => ordering()?.is_gt(),
        5 => ordering()?.is_ge(),
        6 => contains()?,
        7 => !contains()?,
        8 => identical(lhs, rhs),
        9 => !identical(lhs, rhs),
        other => bail!("unknown comparison {}", other),
    })
}

fn identical(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Function(_), Value::Function(_)) | (Value::Code(_), Value::Code(_)) => lhs == rhs,
        _ => false,
    }
}
