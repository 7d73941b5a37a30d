use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::schema::{Entity, Schema};
use crate::Result;

fn to_wire<V: Serialize>(value: &V) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_wire<V: DeserializeOwned>(value: Value) -> Result<V> {
    Ok(serde_json::from_value(value)?)
}

macro_rules! opaque_entity {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl Entity for $ty {
                fn schema() -> &'static Schema<Self> {
                    static SCHEMA: OnceLock<Schema<$ty>> = OnceLock::new();
                    SCHEMA.get_or_init(|| Schema::opaque($name, to_wire::<$ty>, from_wire::<$ty>))
                }
            }
        )*
    };
}

opaque_entity!(
    String => "str",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    Value => "json",
    DateTime<Utc> => "datetime",
    NaiveDate => "date",
);
