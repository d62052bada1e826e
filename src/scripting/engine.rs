//! Rhai Expression Engine Implementation
//!
//! Wraps a configured Rhai [`Engine`] with a program cache. Compilation is
//! checked against the declared scope shape with strict variables, so a
//! typo such as `Var.flag` fails when the graph is built, not per frame.

use super::environment::{ReadOnlyMap, BYTES, FIELD, GLOBAL, TAG, VARS};
use super::{Environment, ExprError, FilterEnvironment, Program, ProgramCache, ScopeShape};
use rhai::{Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST, INT};
use std::sync::RwLock;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Bytes `[off, off + len)` of `b`, or a runtime error
fn window(b: &Blob, off: INT, len: usize) -> RhaiResult<&[u8]> {
    let start = usize::try_from(off).map_err(|_| format!("negative offset {}", off))?;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= b.len())
        .ok_or_else(|| {
            format!(
                "read of {} bytes at offset {} past end of {} bytes",
                len,
                start,
                b.len()
            )
        })?;
    Ok(&b[start..end])
}

fn array<const N: usize>(b: &Blob, off: INT) -> RhaiResult<[u8; N]> {
    let bytes = window(b, off, N)?;
    <[u8; N]>::try_from(bytes).map_err(|_| format!("expected {} bytes", N).into())
}

fn bcd(b: &Blob, off: INT, len: INT) -> RhaiResult<INT> {
    let len = usize::try_from(len)
        .ok()
        .filter(|l| (1..=9).contains(l))
        .ok_or_else(|| format!("bcd length must be 1..=9, got {}", len))?;

    let mut acc: INT = 0;
    for &byte in window(b, off, len)? {
        let (hi, lo) = (byte >> 4, byte & 0x0F);
        if hi > 9 || lo > 9 {
            return Err(format!("invalid BCD byte 0x{:02x}", byte).into());
        }
        acc = acc * 100 + INT::from(hi * 10 + lo);
    }
    Ok(acc)
}

fn bit(v: INT, n: INT) -> RhaiResult<bool> {
    if !(0..64).contains(&n) {
        return Err(format!("bit index {} out of range", n).into());
    }
    Ok((v >> n) & 1 == 1)
}

fn bits(v: INT, lo: INT, len: INT) -> RhaiResult<INT> {
    if !(0..64).contains(&lo) || !(1..=64).contains(&len) || lo + len > 64 {
        return Err(format!("bit range {}+{} out of range", lo, len).into());
    }
    let shifted = (v as u64) >> lo;
    let mask = if len == 64 { u64::MAX } else { (1u64 << len) - 1 };
    Ok((shifted & mask) as INT)
}

fn set_entry(map: &mut Map, name: ImmutableString, value: Dynamic) {
    map.insert(name.as_str().into(), value);
}

/// The expression engine shared by every decode and dispatch worker
pub struct ExprEngine {
    /// The Rhai engine instance
    engine: Engine,
    /// Cache of compiled programs
    cache: RwLock<ProgramCache>,
}

impl ExprEngine {
    /// Create a new expression engine with default configuration
    pub fn new() -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine);

        Self {
            engine,
            cache: RwLock::new(ProgramCache::new()),
        }
    }

    /// Configure the Rhai engine with builtins and safety limits
    fn configure_engine(engine: &mut Engine) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(10_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(64 * 1024);
        engine.set_max_map_size(1_000);
        engine.set_strict_variables(true);

        // ===== Environment Writers =====

        engine.register_fn("set_field", set_entry);
        engine.register_fn("set_tag", set_entry);
        engine.register_fn("set_var", set_entry);

        // ===== Read-only Maps =====

        // No setter is registered, so `Global.x = 1` and `Global.set_var(..)`
        // fail at runtime
        engine
            .register_type_with_name::<ReadOnlyMap>("ReadOnlyMap")
            .register_indexer_get(ReadOnlyMap::get)
            .register_fn("contains", ReadOnlyMap::contains);

        // ===== Byte Readers =====

        engine.register_fn("u8", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(array::<1>(b, off)?[0]))
        });
        engine.register_fn("i8", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(array::<1>(b, off)?[0] as i8))
        });
        engine.register_fn("u16_be", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(u16::from_be_bytes(array(b, off)?)))
        });
        engine.register_fn("u16_le", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(u16::from_le_bytes(array(b, off)?)))
        });
        engine.register_fn("i16_be", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(i16::from_be_bytes(array(b, off)?)))
        });
        engine.register_fn("i16_le", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(i16::from_le_bytes(array(b, off)?)))
        });
        engine.register_fn("u32_be", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(u32::from_be_bytes(array(b, off)?)))
        });
        engine.register_fn("u32_le", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(u32::from_le_bytes(array(b, off)?)))
        });
        engine.register_fn("i32_be", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(i32::from_be_bytes(array(b, off)?)))
        });
        engine.register_fn("i32_le", |b: &mut Blob, off: INT| -> RhaiResult<INT> {
            Ok(INT::from(i32::from_le_bytes(array(b, off)?)))
        });
        engine.register_fn("f32_be", |b: &mut Blob, off: INT| -> RhaiResult<f64> {
            Ok(f64::from(f32::from_be_bytes(array(b, off)?)))
        });
        engine.register_fn("f32_le", |b: &mut Blob, off: INT| -> RhaiResult<f64> {
            Ok(f64::from(f32::from_le_bytes(array(b, off)?)))
        });
        engine.register_fn("bcd", |b: &mut Blob, off: INT, len: INT| bcd(b, off, len));
        engine.register_fn("hex", |b: &mut Blob| -> String {
            b.iter().map(|x| format!("{:02x}", x)).collect()
        });

        // ===== Bit Helpers =====

        engine.register_fn("bit", bit);
        engine.register_fn("bits", bits);
    }

    /// A scope with the variables of `shape`, used only for compilation
    fn shape_scope(shape: ScopeShape) -> Scope<'static> {
        let mut scope = Scope::new();
        match shape {
            ScopeShape::Decode => {
                // Pushed as plain variables so constant propagation cannot
                // fold the empty placeholder maps into the AST
                scope.push(BYTES, Blob::new());
                scope.push(VARS, Map::new());
                scope.push(GLOBAL, ReadOnlyMap::default());
                scope.push(TAG, Map::new());
                scope.push(FIELD, Map::new());
            }
            ScopeShape::Filter => {
                scope.push(TAG, ReadOnlyMap::default());
            }
        }
        scope
    }

    fn compile_ast(&self, source: &str, shape: ScopeShape) -> Result<AST, ExprError> {
        let scope = Self::shape_scope(shape);
        self.engine
            .compile_with_scope(&scope, source)
            .map_err(|e| ExprError::Compile(e.to_string()))
    }

    /// Compile a program and cache it
    pub fn compile(&self, name: &str, source: &str, shape: ScopeShape) -> Result<Program, ExprError> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| ExprError::Compile(format!("Failed to acquire cache lock: {}", e)))?;

        cache.get_or_compile(|| self.compile_ast(source, shape), name, source, shape)
    }

    /// Validate an expression without caching it
    pub fn validate(&self, source: &str, shape: ScopeShape) -> Result<(), ExprError> {
        self.compile_ast(source, shape).map(|_| ())
    }

    fn eval_in(&self, scope: &mut Scope<'static>, ast: &AST) -> Result<Dynamic, ExprError> {
        let len = scope.len();
        let result = self.engine.eval_ast_with_scope::<Dynamic>(scope, ast);
        scope.rewind(len);
        result.map_err(ExprError::from)
    }

    /// Run a decode program, returning its value
    pub fn run(&self, program: &Program, env: &mut Environment) -> Result<Dynamic, ExprError> {
        self.eval_in(env.scope_mut(), program.ast())
    }

    /// Run a section program for its writes to `Vars`, `Tag` and `Field`.
    ///
    /// The value of the last statement is discarded.
    pub fn execute(&self, program: &Program, env: &mut Environment) -> Result<(), ExprError> {
        self.run(program, env).map(|_value| ())
    }

    /// Run a routing condition; a non-bool result is an error
    pub fn test(&self, program: &Program, env: &mut Environment) -> Result<bool, ExprError> {
        let value = self.run(program, env)?;
        value
            .as_bool()
            .map_err(|_| ExprError::NonBoolean(value.type_name().to_string()))
    }

    /// Run a sink filter against the loaded tags
    pub fn matches(&self, program: &Program, env: &mut FilterEnvironment) -> Result<bool, ExprError> {
        let value = self.eval_in(env.scope_mut(), program.ast())?;
        value
            .as_bool()
            .map_err(|_| ExprError::NonBoolean(value.type_name().to_string()))
    }

    /// Number of cached programs
    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for ExprEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExprEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprEngine")
            .field("cache_size", &self.cache_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TagMap, Value};
    use std::collections::BTreeMap;

    fn env_with(bytes: &[u8]) -> Environment {
        let mut globals = BTreeMap::new();
        globals.insert("scale".to_string(), Value::Float(0.5));
        let mut env = Environment::new(&globals);
        env.load_bytes(bytes);
        env
    }

    fn eval(source: &str, bytes: &[u8]) -> Result<Dynamic, ExprError> {
        let engine = ExprEngine::new();
        let program = engine.compile("t", source, ScopeShape::Decode)?;
        engine.run(&program, &mut env_with(bytes))
    }

    #[test]
    fn test_engine_creation() {
        let engine = ExprEngine::new();
        assert_eq!(engine.cache_len(), 0);
    }

    #[test]
    fn test_byte_indexing() {
        assert_eq!(eval("Bytes[2]", &[1, 2, 0xAA]).unwrap().as_int().unwrap(), 170);
    }

    #[test]
    fn test_multi_byte_readers() {
        let b = [0x12, 0x34, 0xFF, 0xFE];
        assert_eq!(eval("u16_be(Bytes, 0)", &b).unwrap().as_int().unwrap(), 0x1234);
        assert_eq!(eval("u16_le(Bytes, 0)", &b).unwrap().as_int().unwrap(), 0x3412);
        assert_eq!(eval("i16_le(Bytes, 2)", &b).unwrap().as_int().unwrap(), -257);
        assert_eq!(eval("u32_be(Bytes, 0)", &b).unwrap().as_int().unwrap(), 0x1234FFFE);
        assert_eq!(eval("i8(Bytes, 2)", &b).unwrap().as_int().unwrap(), -1);
        assert_eq!(eval("Bytes.u8(1)", &b).unwrap().as_int().unwrap(), 0x34);
    }

    #[test]
    fn test_f32_reader() {
        let b = 1.5_f32.to_be_bytes();
        assert_eq!(eval("f32_be(Bytes, 0)", &b).unwrap().as_float().unwrap(), 1.5);
    }

    #[test]
    fn test_reader_out_of_range_is_runtime_error() {
        let err = eval("u32_be(Bytes, 1)", &[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ExprError::Runtime(_)));
        assert!(eval("u8(Bytes, -1)", &[0]).is_err());
    }

    #[test]
    fn test_bcd_and_hex() {
        assert_eq!(eval("bcd(Bytes, 0, 2)", &[0x12, 0x34]).unwrap().as_int().unwrap(), 1234);
        assert!(eval("bcd(Bytes, 0, 1)", &[0x1A]).is_err());
        assert_eq!(
            eval("hex(Bytes)", &[0xDE, 0xAD]).unwrap().into_string().unwrap(),
            "dead"
        );
    }

    #[test]
    fn test_bit_helpers() {
        assert!(eval("bit(0b100, 2)", &[]).unwrap().as_bool().unwrap());
        assert_eq!(eval("bits(0xF0, 4, 4)", &[]).unwrap().as_int().unwrap(), 0xF);
        assert!(eval("bit(1, 64)", &[]).is_err());
    }

    #[test]
    fn test_globals_read_only() {
        assert_eq!(eval("Global.scale * 4.0", &[]).unwrap().as_float().unwrap(), 2.0);
        assert_eq!(eval(r#"Global["scale"]"#, &[]).unwrap().as_float().unwrap(), 0.5);
        assert!(eval(r#""scale" in Global"#, &[]).unwrap().as_bool().unwrap());
        assert!(eval("Global.missing", &[]).unwrap().is_unit());

        assert!(eval("Global = #{}; ()", &[]).is_err());
        assert!(eval("Global.scale = 99; ()", &[]).is_err());
        assert!(eval(r#"Global["scale"] = 99; ()"#, &[]).is_err());
        assert!(eval(r#"Global.set_var("scale", 99); ()"#, &[]).is_err());
    }

    #[test]
    fn test_global_write_attempt_does_not_reach_next_frame() {
        let engine = ExprEngine::new();
        let write = engine
            .compile("w", r#"Global.set_var("scale", 42); ()"#, ScopeShape::Decode)
            .unwrap();
        let read = engine.compile("r", "Global.scale", ScopeShape::Decode).unwrap();

        let mut env = env_with(&[1]);
        assert!(engine.run(&write, &mut env).is_err());
        env.reset();
        env.load_bytes(&[0]);
        assert_eq!(engine.run(&read, &mut env).unwrap().as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_strict_variables_rejected_at_compile() {
        let engine = ExprEngine::new();
        let err = engine
            .compile("t", "Var.flag == 1", ScopeShape::Decode)
            .unwrap_err();
        assert!(matches!(err, ExprError::Compile(_)));
        assert!(engine.validate("Bytes[0]", ScopeShape::Filter).is_err());
        assert!(engine.validate("Tag.device == 1", ScopeShape::Filter).is_ok());
    }

    #[test]
    fn test_setters_write_environment() {
        let engine = ExprEngine::new();
        let program = engine
            .compile(
                "t",
                r#"Vars.set_var("flag", Bytes[0]); Field.set_field("x", Vars.flag + 1); ()"#,
                ScopeShape::Decode,
            )
            .unwrap();
        let mut env = env_with(&[7]);
        let value = engine.run(&program, &mut env).unwrap();
        assert!(value.is_unit());
        assert_eq!(env.var("flag").unwrap().as_int().unwrap(), 7);

        env.emit_point(chrono::Utc::now()).unwrap();
        assert_eq!(env.points()[0].field("x"), Some(&Value::Int(8)));
    }

    #[test]
    fn test_execute_discards_value_keeps_writes() {
        let engine = ExprEngine::new();
        let program = engine
            .compile("t", r#"Tag.set_tag("device", Bytes[0]); Bytes[0] * 2"#, ScopeShape::Decode)
            .unwrap();
        let mut env = env_with(&[4]);
        engine.execute(&program, &mut env).unwrap();

        env.emit_point(chrono::Utc::now()).unwrap();
        assert_eq!(env.points()[0].tag("device"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_local_variables_do_not_leak() {
        let engine = ExprEngine::new();
        let program = engine
            .compile("t", "let tmp = 1; tmp", ScopeShape::Decode)
            .unwrap();
        let mut env = env_with(&[]);
        let before = env.scope_mut().len();
        engine.run(&program, &mut env).unwrap();
        assert_eq!(env.scope_mut().len(), before);
    }

    #[test]
    fn test_condition_must_be_bool() {
        let engine = ExprEngine::new();
        let program = engine.compile("c", "Bytes[0]", ScopeShape::Decode).unwrap();
        let err = engine.test(&program, &mut env_with(&[1])).unwrap_err();
        assert_eq!(err, ExprError::NonBoolean("i64".to_string()));
    }

    #[test]
    fn test_filter_matches() {
        let engine = ExprEngine::new();
        let program = engine
            .compile("f", r#"Tag["type"] == "x""#, ScopeShape::Filter)
            .unwrap();

        let mut fenv = FilterEnvironment::new();
        let mut tags = TagMap::new();
        tags.insert("type".into(), Value::Str("x".into()));
        fenv.load_tags(&tags);
        assert!(engine.matches(&program, &mut fenv).unwrap());

        fenv.load_tags(&TagMap::new());
        assert!(!engine.matches(&program, &mut fenv).unwrap());
    }

    #[test]
    fn test_filter_cannot_modify_tags() {
        let engine = ExprEngine::new();
        let mut fenv = FilterEnvironment::new();
        let mut tags = TagMap::new();
        tags.insert("device".into(), Value::Int(1));
        fenv.load_tags(&tags);

        for source in [
            r#"Tag.set_tag("device", 9); true"#,
            "Tag.device = 9; true",
            "Tag = #{}; true",
        ] {
            let program = engine.compile("w", source, ScopeShape::Filter).unwrap();
            assert!(engine.matches(&program, &mut fenv).is_err(), "{}", source);
        }

        let check = engine
            .compile("c", "Tag.device == 1", ScopeShape::Filter)
            .unwrap();
        assert!(engine.matches(&check, &mut fenv).unwrap());
    }

    #[test]
    fn test_caching() {
        let engine = ExprEngine::new();
        engine.compile("a", "true", ScopeShape::Filter).unwrap();
        engine.compile("b", "true", ScopeShape::Filter).unwrap();
        engine.compile("c", "true", ScopeShape::Decode).unwrap();
        assert_eq!(engine.cache_len(), 2);
    }
}
