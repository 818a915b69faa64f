//! Write-time check for floats JSON cannot represent
//!
//! `serde_json` writes NaN and infinities as `null`, which reads back as a
//! different value or not at all. [`ensure_finite`] walks a value through a
//! serializer that produces nothing and fails on the first non-finite float.

use serde::Serialize;
use serde::ser::{self, Serializer};
use std::fmt::Display;

/// Why a value cannot be stored
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotRepresentable(String);

impl ser::Error for NotRepresentable {
    fn custom<T: Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

type Checked = std::result::Result<(), NotRepresentable>;

/// Fail if `value` contains a NaN or infinite float anywhere
pub fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> Checked {
    value.serialize(FiniteCheck)
}

fn check(v: f64) -> Checked {
    if v.is_finite() {
        Ok(())
    } else {
        Err(NotRepresentable(format!(
            "value contains the non-finite float {v}, which JSON cannot represent"
        )))
    }
}

#[derive(Clone, Copy)]
struct FiniteCheck;

impl Serializer for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Checked {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Checked {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Checked {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Checked {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Checked {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Checked {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Checked {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Checked {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Checked {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Checked {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Checked {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Checked {
        check(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Checked {
        check(v)
    }
    fn serialize_char(self, _: char) -> Checked {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Checked {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Checked {
        Ok(())
    }
    fn serialize_none(self) -> Checked {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Checked {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Checked {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Checked {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Checked {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Checked {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Checked {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Checked {
        key.serialize(*self)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Checked {
        value.serialize(*self)
    }
    fn end(self) -> Checked {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Sample {
        name: String,
        rate: Option<f64>,
        depths: Vec<f32>,
        extra: BTreeMap<String, (u32, f64)>,
    }

    fn sample() -> Sample {
        Sample {
            name: "p1".into(),
            rate: Some(0.25),
            depths: vec![12.0, 30.5],
            extra: BTreeMap::from([("vaf".to_string(), (3, 0.05))]),
        }
    }

    #[test]
    fn finite_values_pass() {
        assert!(ensure_finite(&sample()).is_ok());
        assert!(ensure_finite(&-0.0_f64).is_ok());
        assert!(ensure_finite(&f64::MIN_POSITIVE).is_ok());
        assert!(ensure_finite(&None::<f64>).is_ok());
    }

    #[test]
    fn non_finite_values_anywhere_fail() {
        assert!(ensure_finite(&f64::NAN).is_err());
        assert!(ensure_finite(&vec![1.5, f64::INFINITY]).is_err());

        let mut nested = sample();
        nested.rate = Some(f64::NAN);
        assert!(ensure_finite(&nested).is_err());

        let mut nested = sample();
        nested.depths.push(f32::NEG_INFINITY);
        assert!(ensure_finite(&nested).is_err());

        let mut nested = sample();
        nested.extra.insert("tmb".into(), (1, f64::NAN));
        let err = ensure_finite(&nested).unwrap_err();
        assert!(err.to_string().contains("NaN"));
    }
}
