use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use rustc_hash::FxHashMap;

use super::value::{Builtin, Value, range_len};

/// 运行期全局上下文。
///
/// - 保存全局符号表（内置函数 `range`、`print`、`len` 预先安装）；
/// - `print` 的输出可以被捕获，便于测试断言。
#[derive(Debug, Clone)]
pub struct VmContext {
    globals: FxHashMap<Arc<str>, Value>,
    // Captured `print` lines; `None` writes straight to stdout.
    output: Option<Vec<String>>,
}

impl Default for VmContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VmContext {
    /// 创建带内置函数的上下文。
    pub fn new() -> Self {
        let mut ctx = Self {
            globals: FxHashMap::default(),
            output: None,
        };
        ctx.install_builtins();
        ctx
    }

    /// `print` 写入内部缓冲而非标准输出。
    pub fn capturing() -> Self {
        Self {
            output: Some(Vec::new()),
            ..Self::new()
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) -> Option<Value> {
        self.globals.insert(Arc::from(name), value)
    }

    /// 已捕获的输出行。
    pub fn output(&self) -> &[String] {
        self.output.as_deref().unwrap_or(&[])
    }

    pub(crate) fn emit(&mut self, line: String) {
        match &mut self.output {
            Some(lines) => lines.push(line),
            None => println!("{}", line),
        }
    }

    fn install_builtins(&mut self) {
        for builtin in [
            Builtin { name: "range", func: builtin_range },
            Builtin { name: "print", func: builtin_print },
            Builtin { name: "len", func: builtin_len },
        ] {
            self.set(builtin.name, Value::Builtin(builtin));
        }
    }
}

fn expect_int(value: &Value, what: &str) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(anyhow!("{} expects int, got {}", what, other.type_name())),
    }
}

fn builtin_range(_ctx: &mut VmContext, args: &[Value]) -> Result<Value> {
    let (start, stop, step) = match args {
        [stop] => (0, expect_int(stop, "range")?, 1),
        [start, stop] => (expect_int(start, "range")?, expect_int(stop, "range")?, 1),
        [start, stop, step] => (
            expect_int(start, "range")?,
            expect_int(stop, "range")?,
            expect_int(step, "range")?,
        ),
        _ => bail!("range expected 1 to 3 arguments, got {}", args.len()),
    };
    if step == 0 {
        bail!("range() arg 3 must not be zero");
    }
    Ok(Value::Range { start, stop, step })
}

fn builtin_print(ctx: &mut VmContext, args: &[Value]) -> Result<Value> {
    let line = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
    ctx.emit(line);
    Ok(Value::None)
}

fn builtin_len(_ctx: &mut VmContext, args: &[Value]) -> Result<Value> {
    let [value] = args else {
        bail!("len() takes exactly one argument ({} given)", args.len());
    };
    let len = match value {
        Value::Str(s) => s.chars().count() as i64,
        Value::Tuple(items) => items.len() as i64,
        Value::Range { start, stop, step } => range_len(*start, *stop, *step),
        other => bail!("object of type '{}' has no len()", other.type_name()),
    };
    Ok(Value::Int(len))
}
