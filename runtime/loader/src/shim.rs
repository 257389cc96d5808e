//! # Soft-float call shims
//!
//! Images built for the soft-float ABI pass `double` and `float` arguments
//! in integer registers. The trampolines here take those raw bits as
//! integers, reinterpret them, call the `libm` routine and hand the result
//! back as bits. Registering them under the plain library names redirects
//! every call site in the image.

use crate::error::LoadError;
use crate::imports::ImportTable;

/// Calls a unary `f64` function on soft-float argument bits.
#[inline]
pub fn soft_f64(x: i64, f: fn(f64) -> f64) -> i64 {
    f(f64::from_bits(x as u64)).to_bits() as i64
}

/// Calls a binary `f64` function on soft-float argument bits.
#[inline]
pub fn soft_f64_2(x: i64, y: i64, f: fn(f64, f64) -> f64) -> i64 {
    f(f64::from_bits(x as u64), f64::from_bits(y as u64)).to_bits() as i64
}

/// Calls a binary `f32` function on soft-float argument bits.
#[inline]
pub fn soft_f32_2(x: i32, y: i32, f: fn(f32, f32) -> f32) -> i32 {
    f(f32::from_bits(x as u32), f32::from_bits(y as u32)).to_bits() as i32
}

macro_rules! unary_shims {
    ($($name:ident => $func:path),* $(,)?) => {
        $(
            pub extern "C" fn $name(x: i64) -> i64 {
                soft_f64(x, $func)
            }
        )*
    };
}

macro_rules! binary_shims {
    ($($name:ident => $func:path),* $(,)?) => {
        $(
            pub extern "C" fn $name(x: i64, y: i64) -> i64 {
                soft_f64_2(x, y, $func)
            }
        )*
    };
}

unary_shims! {
    acos_soft => libm::acos,
    asin_soft => libm::asin,
    atan_soft => libm::atan,
    ceil_soft => libm::ceil,
    cos_soft => libm::cos,
    floor_soft => libm::floor,
    log_soft => libm::log,
    sin_soft => libm::sin,
    sqrt_soft => libm::sqrt,
    tan_soft => libm::tan,
}

binary_shims! {
    atan2_soft => libm::atan2,
    fmod_soft => libm::fmod,
    pow_soft => libm::pow,
}

/// `ldexp` keeps its exponent in an integer register on both ABIs.
pub extern "C" fn ldexp_soft(x: i64, exp: i32) -> i64 {
    libm::ldexp(f64::from_bits(x as u64), exp).to_bits() as i64
}

pub extern "C" fn powf_soft(x: i32, y: i32) -> i32 {
    soft_f32_2(x, y, libm::powf)
}

/// Library name and trampoline of every shim, in registration order.
pub const SOFT_FLOAT_SHIMS: &[(&str, *const ())] = &[
    ("acos", acos_soft as *const ()),
    ("asin", asin_soft as *const ()),
    ("atan", atan_soft as *const ()),
    ("atan2", atan2_soft as *const ()),
    ("ceil", ceil_soft as *const ()),
    ("cos", cos_soft as *const ()),
    ("floor", floor_soft as *const ()),
    ("fmod", fmod_soft as *const ()),
    ("ldexp", ldexp_soft as *const ()),
    ("log", log_soft as *const ()),
    ("pow", pow_soft as *const ()),
    ("sin", sin_soft as *const ()),
    ("sqrt", sqrt_soft as *const ()),
    ("tan", tan_soft as *const ()),
    ("powf", powf_soft as *const ()),
];

/// Appends every shim to `table` under its library name.
pub fn register(table: &mut ImportTable) -> Result<(), LoadError> {
    for &(name, shim) in SOFT_FLOAT_SHIMS {
        table.append(name, shim as usize)?;
    }
    log::debug!("registered {} soft-float shims", SOFT_FLOAT_SHIMS.len());
    Ok(())
}
