//! Casting of [`RawValue`] cells into the column types of the ToO datamodel.
//!
//! In [`ValidationMode::Strict`] the raw kind must match the column kind: integer narrowing
//! must fit, `f64 → f32` must be exact, and the only accepted widening is an integer into a
//! float column when it is exactly representable. In [`ValidationMode::Coercive`] strings are
//! parsed, integral floats become integers, and `f64 → f32` rounds; a value fails only on
//! overflow or when it cannot be interpreted at all.

use crate::datamodel::{ColumnType, FiberType, RawValue, SkyBrightnessMode};

use super::{IssueKind, ValidationMode};

/// Largest integer magnitude an `f64` represents exactly.
const F64_EXACT_INT: u64 = 1 << 53;

/// A cell after casting to its column type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Fiber(FiberType),
    Sky(SkyBrightnessMode),
}

/// Cast one cell.
///
/// Return
/// ------
/// * `Ok(None)` for a null cell
/// * `Ok(Some(v))` with `v` already range checked for the column type
/// * `Err(kind)` describing why the value cannot be represented
pub fn cast_value(
    value: &RawValue,
    ty: ColumnType,
    mode: ValidationMode,
) -> Result<Option<TypedValue>, IssueKind> {
    if value.is_null() {
        return Ok(None);
    }
    let typed = match ty {
        ColumnType::Int64 => TypedValue::Int(to_int(value, ty, mode, i64::MIN, i64::MAX)?),
        ColumnType::Int32 => TypedValue::Int(to_int(
            value,
            ty,
            mode,
            i32::MIN.into(),
            i32::MAX.into(),
        )?),
        ColumnType::Int16 => TypedValue::Int(to_int(
            value,
            ty,
            mode,
            i16::MIN.into(),
            i16::MAX.into(),
        )?),
        ColumnType::Float64 => TypedValue::Float(to_f64(value, ty, mode)?),
        ColumnType::Float32 => TypedValue::Float(to_f32(value, ty, mode)?.into()),
        ColumnType::Bool => TypedValue::Bool(to_bool(value, ty, mode)?),
        ColumnType::Text => TypedValue::Text(to_text(value, ty, mode)?),
        ColumnType::Fiber => TypedValue::Fiber(parse_enum(value, ty)?),
        ColumnType::SkyBrightness => TypedValue::Sky(parse_enum(value, ty)?),
    };
    Ok(Some(typed))
}

fn mismatch(value: &RawValue, ty: ColumnType) -> IssueKind {
    IssueKind::TypeMismatch {
        expected: ty,
        found: value.to_string(),
    }
}

fn to_int(
    value: &RawValue,
    ty: ColumnType,
    mode: ValidationMode,
    min: i64,
    max: i64,
) -> Result<i64, IssueKind> {
    let wide: i128 = match (value, mode) {
        (RawValue::Int(i), _) => (*i).into(),
        (RawValue::Float(x), ValidationMode::Coercive) => integral_float(*x, value, ty)?,
        (RawValue::Str(s), ValidationMode::Coercive) => {
            let s = s.trim();
            match s.parse::<i128>() {
                Ok(i) => i,
                Err(_) => {
                    let x = s
                        .parse::<f64>()
                        .map_err(|_| IssueKind::Unparsable(s.to_string()))?;
                    integral_float(x, value, ty)?
                }
            }
        }
        _ => return Err(mismatch(value, ty)),
    };
    if wide < i128::from(min) || wide > i128::from(max) {
        return Err(IssueKind::Overflow {
            ty,
            value: value.to_string(),
        });
    }
    i64::try_from(wide).map_err(|_| IssueKind::Overflow {
        ty,
        value: value.to_string(),
    })
}

fn integral_float(x: f64, value: &RawValue, ty: ColumnType) -> Result<i128, IssueKind> {
    if !x.is_finite() || x.fract() != 0.0 {
        return Err(IssueKind::PrecisionLoss {
            ty,
            value: value.to_string(),
        });
    }
    // Beyond the i128 range the bounds check in `to_int` rejects it anyway.
    if x.abs() >= 1.7e38 {
        return Err(IssueKind::Overflow {
            ty,
            value: value.to_string(),
        });
    }
    Ok(x as i128)
}

fn to_f64(value: &RawValue, ty: ColumnType, mode: ValidationMode) -> Result<f64, IssueKind> {
    match (value, mode) {
        (RawValue::Float(x), _) => Ok(*x),
        (RawValue::Int(i), ValidationMode::Strict) => {
            if i.unsigned_abs() <= F64_EXACT_INT {
                Ok(*i as f64)
            } else {
                Err(IssueKind::PrecisionLoss {
                    ty,
                    value: value.to_string(),
                })
            }
        }
        (RawValue::Int(i), ValidationMode::Coercive) => Ok(*i as f64),
        (RawValue::Str(s), ValidationMode::Coercive) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| IssueKind::Unparsable(s.clone())),
        _ => Err(mismatch(value, ty)),
    }
}

fn to_f32(value: &RawValue, ty: ColumnType, mode: ValidationMode) -> Result<f32, IssueKind> {
    let x = to_f64(value, ty, mode)?;
    if x.is_finite() && x.abs() > f64::from(f32::MAX) {
        return Err(IssueKind::Overflow {
            ty,
            value: value.to_string(),
        });
    }
    let narrow = x as f32;
    if mode == ValidationMode::Strict && x.is_finite() && f64::from(narrow) != x {
        return Err(IssueKind::PrecisionLoss {
            ty,
            value: value.to_string(),
        });
    }
    Ok(narrow)
}

fn to_bool(value: &RawValue, ty: ColumnType, mode: ValidationMode) -> Result<bool, IssueKind> {
    match (value, mode) {
        (RawValue::Bool(b), _) => Ok(*b),
        (RawValue::Int(0), ValidationMode::Coercive) => Ok(false),
        (RawValue::Int(1), ValidationMode::Coercive) => Ok(true),
        (RawValue::Str(s), ValidationMode::Coercive) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(true),
                "false" | "f" | "no" | "n" | "0" => Ok(false),
                _ => Err(IssueKind::Unparsable(s.clone())),
            }
        }
        _ => Err(mismatch(value, ty)),
    }
}

fn to_text(value: &RawValue, ty: ColumnType, mode: ValidationMode) -> Result<String, IssueKind> {
    match (value, mode) {
        (RawValue::Str(s), _) => Ok(s.clone()),
        (RawValue::Int(i), ValidationMode::Coercive) => Ok(i.to_string()),
        (RawValue::Float(x), ValidationMode::Coercive) => Ok(x.to_string()),
        (RawValue::Bool(b), ValidationMode::Coercive) => Ok(b.to_string()),
        _ => Err(mismatch(value, ty)),
    }
}

fn parse_enum<E: std::str::FromStr>(value: &RawValue, ty: ColumnType) -> Result<E, IssueKind> {
    match value {
        RawValue::Str(s) => s.parse::<E>().map_err(|_| IssueKind::InvalidValue {
            expected: ty,
            found: s.clone(),
        }),
        _ => Err(mismatch(value, ty)),
    }
}

#[cfg(test)]
mod coerce_test {
    use super::*;
    use ValidationMode::{Coercive, Strict};

    #[test]
    fn test_null_passes_through() {
        assert_eq!(cast_value(&RawValue::Null, ColumnType::Int64, Strict), Ok(None));
        assert_eq!(
            cast_value(&RawValue::Float(f64::NAN), ColumnType::Float32, Strict),
            Ok(None)
        );
    }

    #[test]
    fn test_strict_integer_narrowing() {
        assert_eq!(
            cast_value(&RawValue::Int(10), ColumnType::Int16, Strict),
            Ok(Some(TypedValue::Int(10)))
        );
        assert!(matches!(
            cast_value(&RawValue::Int(40_000), ColumnType::Int16, Strict),
            Err(IssueKind::Overflow { .. })
        ));
        assert!(matches!(
            cast_value(&RawValue::Float(3.0), ColumnType::Int16, Strict),
            Err(IssueKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_strict_float32_must_be_exact() {
        assert_eq!(
            cast_value(&RawValue::Float(15.5), ColumnType::Float32, Strict),
            Ok(Some(TypedValue::Float(15.5)))
        );
        assert!(matches!(
            cast_value(&RawValue::Float(15.3), ColumnType::Float32, Strict),
            Err(IssueKind::PrecisionLoss { .. })
        ));
        // exact integer widening is accepted
        assert_eq!(
            cast_value(&RawValue::Int(0), ColumnType::Float32, Strict),
            Ok(Some(TypedValue::Float(0.0)))
        );
    }

    #[test]
    fn test_coercive_casts() {
        assert_eq!(
            cast_value(&RawValue::Str(" 12 ".into()), ColumnType::Int32, Coercive),
            Ok(Some(TypedValue::Int(12)))
        );
        assert_eq!(
            cast_value(&RawValue::Float(7.0), ColumnType::Int16, Coercive),
            Ok(Some(TypedValue::Int(7)))
        );
        assert!(matches!(
            cast_value(&RawValue::Float(7.5), ColumnType::Int16, Coercive),
            Err(IssueKind::PrecisionLoss { .. })
        ));
        assert_eq!(
            cast_value(&RawValue::Float(15.3), ColumnType::Float32, Coercive),
            Ok(Some(TypedValue::Float(f64::from(15.3_f32))))
        );
        assert!(matches!(
            cast_value(&RawValue::Float(1e300), ColumnType::Float32, Coercive),
            Err(IssueKind::Overflow { .. })
        ));
        assert_eq!(
            cast_value(&RawValue::Str("yes".into()), ColumnType::Bool, Coercive),
            Ok(Some(TypedValue::Bool(true)))
        );
        assert!(matches!(
            cast_value(&RawValue::Str("abc".into()), ColumnType::Float64, Coercive),
            Err(IssueKind::Unparsable(_))
        ));
        assert!(matches!(
            cast_value(&RawValue::Str("1e12".into()), ColumnType::Int32, Coercive),
            Err(IssueKind::Overflow { .. })
        ));
    }

    #[test]
    fn test_enum_columns() {
        assert_eq!(
            cast_value(&RawValue::Str("boss".into()), ColumnType::Fiber, Strict),
            Ok(Some(TypedValue::Fiber(FiberType::Boss)))
        );
        assert!(matches!(
            cast_value(&RawValue::Str("grey".into()), ColumnType::SkyBrightness, Coercive),
            Err(IssueKind::InvalidValue { .. })
        ));
    }
}
