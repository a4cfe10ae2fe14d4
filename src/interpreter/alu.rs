//! Arithmetic and conversion semantics.
//!
//! Integer ops are two's-complement modulo the bit width; shifts mask
//! the amount, rotates are modulo the width. Floats follow IEEE-754
//! with one amendment: an operation that must return a NaN produces it
//! by OR-ing the quiet bit into the payload of a NaN input, so NaN
//! payloads stay deterministic across platforms.

use super::Interpreter;
use crate::error::VmError;

/// Quiet bit of an `f32` NaN payload.
const F32_QUIET_BIT: u32 = 0x0040_0000;

/// Quiet bit of an `f64` NaN payload.
const F64_QUIET_BIT: u64 = 0x0008_0000_0000_0000;

impl<'m> Interpreter<'m> {
    /* combinators */

    pub(crate) fn i32_unop(&mut self, f: impl FnOnce(i32) -> i32) -> Result<(), VmError> {
        let x = self.pop_i32()?;
        self.push_i32(f(x))
    }

    pub(crate) fn i32_binop(&mut self, f: impl FnOnce(i32, i32) -> i32) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;
        self.push_i32(f(x, y))
    }

    pub(crate) fn i32_cmp(&mut self, f: impl FnOnce(i32, i32) -> bool) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;
        self.push_i32(f(x, y) as i32)
    }

    pub(crate) fn i64_unop(&mut self, f: impl FnOnce(i64) -> i64) -> Result<(), VmError> {
        let x = self.pop_i64()?;
        self.push_i64(f(x))
    }

    pub(crate) fn i64_binop(&mut self, f: impl FnOnce(i64, i64) -> i64) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;
        self.push_i64(f(x, y))
    }

    pub(crate) fn i64_cmp(&mut self, f: impl FnOnce(i64, i64) -> bool) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;
        self.push_i32(f(x, y) as i32)
    }

    pub(crate) fn f32_unop(&mut self, f: impl FnOnce(f32) -> f32) -> Result<(), VmError> {
        let x = self.pop_f32()?;
        self.push_f32(f(x))
    }

    pub(crate) fn f32_binop(&mut self, f: impl FnOnce(f32, f32) -> f32) -> Result<(), VmError> {
        let y = self.pop_f32()?;
        let x = self.pop_f32()?;
        self.push_f32(f(x, y))
    }

    /// Unary float op with the NaN propagation rule applied.
    pub(crate) fn f32_round(&mut self, f: impl FnOnce(f32) -> f32) -> Result<(), VmError> {
        let x = self.pop_f32()?;
        let result = if x.is_nan() { Self::quiet_f32(x) } else { f(x) };
        self.push_f32(result)
    }

    /// Binary float op with the NaN propagation rule applied.
    pub(crate) fn f32_arith(&mut self, f: impl FnOnce(f32, f32) -> f32) -> Result<(), VmError> {
        let y = self.pop_f32()?;
        let x = self.pop_f32()?;

        let result = if x.is_nan() {
            Self::quiet_f32(x)
        } else if y.is_nan() {
            Self::quiet_f32(y)
        } else {
            f(x, y)
        };

        self.push_f32(result)
    }

    pub(crate) fn f32_cmp(&mut self, f: impl FnOnce(f32, f32) -> bool) -> Result<(), VmError> {
        let y = self.pop_f32()?;
        let x = self.pop_f32()?;
        self.push_i32(f(x, y) as i32)
    }

    pub(crate) fn f64_unop(&mut self, f: impl FnOnce(f64) -> f64) -> Result<(), VmError> {
        let x = self.pop_f64()?;
        self.push_f64(f(x))
    }

    pub(crate) fn f64_binop(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), VmError> {
        let y = self.pop_f64()?;
        let x = self.pop_f64()?;
        self.push_f64(f(x, y))
    }

    pub(crate) fn f64_round(&mut self, f: impl FnOnce(f64) -> f64) -> Result<(), VmError> {
        let x = self.pop_f64()?;
        let result = if x.is_nan() { Self::quiet_f64(x) } else { f(x) };
        self.push_f64(result)
    }

    pub(crate) fn f64_arith(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), VmError> {
        let y = self.pop_f64()?;
        let x = self.pop_f64()?;

        let result = if x.is_nan() {
            Self::quiet_f64(x)
        } else if y.is_nan() {
            Self::quiet_f64(y)
        } else {
            f(x, y)
        };

        self.push_f64(result)
    }

    pub(crate) fn f64_cmp(&mut self, f: impl FnOnce(f64, f64) -> bool) -> Result<(), VmError> {
        let y = self.pop_f64()?;
        let x = self.pop_f64()?;
        self.push_i32(f(x, y) as i32)
    }

    /* trapping integer division */

    pub(crate) fn exec_i32_div_s(&mut self) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;

        if y == 0 {
            return Err(VmError::I32DivideByZero);
        }
        if x == i32::MIN && y == -1 {
            return Err(VmError::I32Overflow);
        }

        self.push_i32(x.wrapping_div(y))
    }

    pub(crate) fn exec_i32_div_u(&mut self) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;

        if y == 0 {
            return Err(VmError::I32DivideByZero);
        }

        self.push_i32((x as u32 / y as u32) as i32)
    }

    pub(crate) fn exec_i32_rem_s(&mut self) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;

        if y == 0 {
            return Err(VmError::I32DivideByZero);
        }

        // rem(MIN, -1) is 0, not a trap.
        self.push_i32(x.wrapping_rem(y))
    }

    pub(crate) fn exec_i32_rem_u(&mut self) -> Result<(), VmError> {
        let y = self.pop_i32()?;
        let x = self.pop_i32()?;

        if y == 0 {
            return Err(VmError::I32DivideByZero);
        }

        self.push_i32((x as u32 % y as u32) as i32)
    }

    pub(crate) fn exec_i64_div_s(&mut self) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;

        if y == 0 {
            return Err(VmError::I64DivideByZero);
        }
        if x == i64::MIN && y == -1 {
            return Err(VmError::I64Overflow);
        }

        self.push_i64(x.wrapping_div(y))
    }

    pub(crate) fn exec_i64_div_u(&mut self) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;

        if y == 0 {
            return Err(VmError::I64DivideByZero);
        }

        self.push_i64((x as u64 / y as u64) as i64)
    }

    pub(crate) fn exec_i64_rem_s(&mut self) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;

        if y == 0 {
            return Err(VmError::I64DivideByZero);
        }

        self.push_i64(x.wrapping_rem(y))
    }

    pub(crate) fn exec_i64_rem_u(&mut self) -> Result<(), VmError> {
        let y = self.pop_i64()?;
        let x = self.pop_i64()?;

        if y == 0 {
            return Err(VmError::I64DivideByZero);
        }

        self.push_i64((x as u64 % y as u64) as i64)
    }

    /* float helpers */

    pub(crate) fn quiet_f32(x: f32) -> f32 {
        f32::from_bits(x.to_bits() | F32_QUIET_BIT)
    }

    pub(crate) fn quiet_f64(x: f64) -> f64 {
        f64::from_bits(x.to_bits() | F64_QUIET_BIT)
    }

    /// Round to nearest integer, ties to even, sign of zero preserved.
    pub(crate) fn nearest_f64(x: f64) -> f64 {
        let rounded = x.round();

        let result = if (rounded - x).abs() == 0.5 && rounded % 2.0 != 0.0 {
            rounded - x.signum()
        } else {
            rounded
        };

        if result == 0.0 && x.is_sign_negative() {
            -0.0
        } else {
            result
        }
    }

    pub(crate) fn nearest_f32(x: f32) -> f32 {
        // Exact: every f32 and its rounding are representable in f64.
        Self::nearest_f64(x as f64) as f32
    }

    /// NaN inputs are handled by the caller; equal-magnitude zeroes
    /// order as -0 < +0.
    pub(crate) fn min_f32(x: f32, y: f32) -> f32 {
        if x == y {
            if x.is_sign_negative() {
                x
            } else {
                y
            }
        } else if x < y {
            x
        } else {
            y
        }
    }

    pub(crate) fn max_f32(x: f32, y: f32) -> f32 {
        if x == y {
            if x.is_sign_positive() {
                x
            } else {
                y
            }
        } else if x > y {
            x
        } else {
            y
        }
    }

    pub(crate) fn min_f64(x: f64, y: f64) -> f64 {
        if x == y {
            if x.is_sign_negative() {
                x
            } else {
                y
            }
        } else if x < y {
            x
        } else {
            y
        }
    }

    pub(crate) fn max_f64(x: f64, y: f64) -> f64 {
        if x == y {
            if x.is_sign_positive() {
                x
            } else {
                y
            }
        } else if x > y {
            x
        } else {
            y
        }
    }

    /* trapping float -> int truncation */

    pub(crate) fn trunc_to_i32_s(x: f64, overflow: VmError) -> Result<i32, VmError> {
        if x.is_nan() {
            return Err(VmError::InvalidIntegerConversion);
        }

        let t = x.trunc();
        if t < i32::MIN as f64 || t > i32::MAX as f64 {
            return Err(overflow);
        }

        Ok(t as i32)
    }

    pub(crate) fn trunc_to_i32_u(x: f64, overflow: VmError) -> Result<i32, VmError> {
        if x.is_nan() {
            return Err(VmError::InvalidIntegerConversion);
        }

        let t = x.trunc();
        if t < 0.0 || t > u32::MAX as f64 {
            return Err(overflow);
        }

        Ok(t as u32 as i32)
    }

    pub(crate) fn trunc_to_i64_s(x: f64, overflow: VmError) -> Result<i64, VmError> {
        if x.is_nan() {
            return Err(VmError::InvalidIntegerConversion);
        }

        let t = x.trunc();
        // 2^63 rounds i64::MAX up, so >= catches the unrepresentable edge.
        if t < i64::MIN as f64 || t >= i64::MAX as f64 {
            return Err(overflow);
        }

        Ok(t as i64)
    }

    pub(crate) fn trunc_to_i64_u(x: f64, overflow: VmError) -> Result<i64, VmError> {
        if x.is_nan() {
            return Err(VmError::InvalidIntegerConversion);
        }

        let t = x.trunc();
        if t < 0.0 || t >= u64::MAX as f64 {
            return Err(overflow);
        }

        Ok(t as u64 as i64)
    }
}
