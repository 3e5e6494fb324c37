//! Lua Math Library Implementation

use super::{new_lib, LibFn};
use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{ExecutionContext, LuaVM};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Initialize the math library
pub fn init_math_lib(vm: &mut LuaVM) -> Result<()> {
    let funcs: &[(&str, LibFn)] = &[
        ("abs", math_abs),
        ("ceil", math_ceil),
        ("floor", math_floor),
        ("sqrt", math_sqrt),
        ("sin", math_sin),
        ("cos", math_cos),
        ("tan", math_tan),
        ("asin", math_asin),
        ("acos", math_acos),
        ("atan", math_atan),
        ("atan2", math_atan2),
        ("exp", math_exp),
        ("log", math_log),
        ("log10", math_log10),
        ("pow", math_pow),
        ("fmod", math_fmod),
        ("modf", math_modf),
        ("frexp", math_frexp),
        ("ldexp", math_ldexp),
        ("deg", math_deg),
        ("rad", math_rad),
        ("max", math_max),
        ("min", math_min),
        ("random", math_random),
        ("randomseed", math_randomseed),
    ];
    let lib = new_lib(vm, "math", funcs)?;
    vm.heap
        .table_set(lib, Value::from("huge"), Value::Number(f64::INFINITY))?;
    vm.heap.table_set(lib, Value::from("pi"), Value::Number(PI))?;
    Ok(())
}

fn unary(ctx: &mut ExecutionContext, f: impl Fn(f64) -> f64) -> Result<Vec<Value>> {
    let x = ctx.check_number(1)?;
    Ok(vec![Value::Number(f(x))])
}

fn binary(ctx: &mut ExecutionContext, f: impl Fn(f64, f64) -> f64) -> Result<Vec<Value>> {
    let x = ctx.check_number(1)?;
    let y = ctx.check_number(2)?;
    Ok(vec![Value::Number(f(x, y))])
}

/// Math.abs function - returns the absolute value of a number
/// Signature: math.abs(x)
pub fn math_abs(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::abs)
}

/// Math.ceil function - returns the smallest integer not below x
/// Signature: math.ceil(x)
pub fn math_ceil(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::ceil)
}

/// Math.floor function - returns the largest integer not above x
/// Signature: math.floor(x)
pub fn math_floor(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::floor)
}

/// Signature: math.sqrt(x)
pub fn math_sqrt(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::sqrt)
}

/// Signature: math.sin(x)
pub fn math_sin(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::sin)
}

/// Signature: math.cos(x)
pub fn math_cos(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::cos)
}

/// Signature: math.tan(x)
pub fn math_tan(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::tan)
}

/// Signature: math.asin(x)
pub fn math_asin(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::asin)
}

/// Signature: math.acos(x)
pub fn math_acos(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::acos)
}

/// Signature: math.atan(x)
pub fn math_atan(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::atan)
}

/// Math.atan2 function - arc tangent of y/x using the signs of both
/// Signature: math.atan2(y, x)
pub fn math_atan2(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    binary(ctx, f64::atan2)
}

/// Signature: math.exp(x)
pub fn math_exp(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::exp)
}

/// Math.log function - natural logarithm
/// Signature: math.log(x)
pub fn math_log(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::ln)
}

/// Signature: math.log10(x)
pub fn math_log10(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::log10)
}

/// Signature: math.pow(x, y)
pub fn math_pow(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    binary(ctx, f64::powf)
}

/// Math.fmod function - remainder with the sign of the dividend (C `fmod`)
/// Signature: math.fmod(x, y)
pub fn math_fmod(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    binary(ctx, |x, y| x % y)
}

/// Math.modf function - integral and fractional parts
/// Signature: math.modf(x)
pub fn math_modf(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let x = ctx.check_number(1)?;
    let int = x.trunc();
    let frac = if x.is_infinite() { 0.0 } else { x - int };
    Ok(vec![Value::Number(int), Value::Number(frac)])
}

/// Split `x` into a mantissa in [0.5, 1) and a power of two
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let mut exp = x.abs().log2().floor() as i32 + 1;
    let mut mantissa = x / 2f64.powi(exp);
    if mantissa.abs() >= 1.0 {
        mantissa /= 2.0;
        exp += 1;
    } else if mantissa.abs() < 0.5 {
        mantissa *= 2.0;
        exp -= 1;
    }
    (mantissa, exp)
}

/// `m * 2^e` without overflowing the intermediate power
fn ldexp(m: f64, e: i32) -> f64 {
    let half = e / 2;
    m * 2f64.powi(half) * 2f64.powi(e - half)
}

/// Math.frexp function - mantissa and exponent
/// Signature: math.frexp(x)
pub fn math_frexp(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let (m, e) = frexp(ctx.check_number(1)?);
    Ok(vec![Value::Number(m), Value::from(e as i64)])
}

/// Math.ldexp function - builds m * 2^e
/// Signature: math.ldexp(m, e)
pub fn math_ldexp(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let m = ctx.check_number(1)?;
    let e = ctx.check_integer(2)?.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    Ok(vec![Value::Number(ldexp(m, e))])
}

/// Signature: math.deg(x)
pub fn math_deg(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::to_degrees)
}

/// Signature: math.rad(x)
pub fn math_rad(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    unary(ctx, f64::to_radians)
}

/// Math.max function - largest argument
/// Signature: math.max(x, ...)
pub fn math_max(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let mut best = ctx.check_number(1)?;
    for n in 2..=ctx.arg_count() {
        let x = ctx.check_number(n)?;
        if x > best {
            best = x;
        }
    }
    Ok(vec![Value::Number(best)])
}

/// Math.min function - smallest argument
/// Signature: math.min(x, ...)
pub fn math_min(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let mut best = ctx.check_number(1)?;
    for n in 2..=ctx.arg_count() {
        let x = ctx.check_number(n)?;
        if x < best {
            best = x;
        }
    }
    Ok(vec![Value::Number(best)])
}

/// Math.random function - returns a random number
/// Signature: math.random([m [, n]])
pub fn math_random(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let value = match ctx.arg_count() {
        0 => ctx.vm.rng.gen::<f64>(),
        1 => {
            let m = ctx.check_integer(1)?;
            if m < 1 {
                return Err(ctx.arg_error(1, "interval is empty"));
            }
            ctx.vm.rng.gen_range(1..=m) as f64
        }
        2 => {
            let m = ctx.check_integer(1)?;
            let n = ctx.check_integer(2)?;
            if m > n {
                return Err(ctx.arg_error(2, "interval is empty"));
            }
            ctx.vm.rng.gen_range(m..=n) as f64
        }
        _ => return Err(LuaError::host_fault("wrong number of arguments")),
    };
    Ok(vec![Value::Number(value)])
}

/// Math.randomseed function - sets the seed for the random generator
/// Signature: math.randomseed(x)
pub fn math_randomseed(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let seed = ctx.check_integer(1)?;
    ctx.vm.rng = StdRng::seed_from_u64(seed as u64);
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frexp() {
        assert_eq!(frexp(8.0), (0.5, 4));
        assert_eq!(frexp(-3.0), (-0.75, 2));
        assert_eq!(frexp(0.0), (0.0, 0));
        assert_eq!(frexp(1.0), (0.5, 1));
    }

    #[test]
    fn test_ldexp() {
        assert_eq!(ldexp(0.5, 4), 8.0);
        assert_eq!(ldexp(1.0, -1), 0.5);
        assert_eq!(ldexp(1.0, 1030), f64::INFINITY);
        assert_eq!(ldexp(2f64.powi(1000), -1000), 1.0);
    }
}
