//! YAML documents with every scalar kept as written
//!
//! Template values are strings, so `0x1F`, `1.50` and `True` must reach the
//! loader spelled the way the author wrote them. Each document is read twice:
//! once to learn its shape, then again with `deserialize_str` on every scalar.

use std::fmt;

use serde::de::{
    self, DeserializeSeed, Deserializer, EnumAccess, IgnoredAny, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use serde::Deserialize;
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};

/// Parse every document in `source`; plain scalars come back as `Value::String`
pub fn documents(source: &str) -> impl Iterator<Item = Result<Value, serde_yaml::Error>> + '_ {
    let shapes = serde_yaml::Deserializer::from_str(source);
    let values = serde_yaml::Deserializer::from_str(source);
    shapes.zip(values).map(|(shape, value)| {
        let shape = Shape::deserialize(shape)?;
        ShapedSeed(&shape).deserialize(value)
    })
}

/// Structure of a document with scalar contents discarded
#[derive(Debug, PartialEq)]
enum Shape {
    Null,
    Scalar,
    Seq(Vec<Shape>),
    Map(Vec<(Shape, Shape)>),
    Tagged(Box<Shape>),
}

impl<'de> Deserialize<'de> for Shape {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ShapeVisitor)
    }
}

struct ShapeVisitor;

impl<'de> Visitor<'de> for ShapeVisitor {
    type Value = Shape;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("any YAML node")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_i128<E: de::Error>(self, _: i128) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_u128<E: de::Error>(self, _: u128) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Shape, E> {
        Ok(Shape::Scalar)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Shape, E> {
        Ok(Shape::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Shape, E> {
        Ok(Shape::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Shape, D::Error> {
        Shape::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Shape, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Shape::Seq(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Shape, A::Error> {
        let mut entries = Vec::new();
        while let Some(entry) = map.next_entry()? {
            entries.push(entry);
        }
        Ok(Shape::Map(entries))
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Shape, A::Error> {
        let (_, contents): (IgnoredAny, _) = data.variant()?;
        contents
            .newtype_variant()
            .map(|inner| Shape::Tagged(Box::new(inner)))
    }
}

/// Rebuilds a `Value` along a known shape, reading scalars as raw text
struct ShapedSeed<'a>(&'a Shape);

impl<'de> DeserializeSeed<'de> for ShapedSeed<'_> {
    type Value = Value;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        match self.0 {
            Shape::Null => IgnoredAny::deserialize(deserializer).map(|_| Value::Null),
            Shape::Scalar => deserializer.deserialize_str(RawScalar).map(Value::String),
            Shape::Seq(items) => deserializer.deserialize_seq(SeqVisitor(items)),
            Shape::Map(entries) => deserializer.deserialize_map(MapVisitor(entries)),
            Shape::Tagged(inner) => deserializer.deserialize_any(TaggedVisitor(inner)),
        }
    }
}

struct RawScalar;

impl<'de> Visitor<'de> for RawScalar {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a scalar")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        Ok(v.to_owned())
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
        Ok(v)
    }
}

struct SeqVisitor<'a>(&'a [Shape]);

impl<'de> Visitor<'de> for SeqVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a sequence of {} items", self.0.len())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(self.0.len());
        for shape in self.0 {
            match seq.next_element_seed(ShapedSeed(shape))? {
                Some(item) => items.push(item),
                None => return Err(de::Error::invalid_length(items.len(), &self)),
            }
        }
        Ok(Value::Sequence(items))
    }
}

struct MapVisitor<'a>(&'a [(Shape, Shape)]);

impl<'de> Visitor<'de> for MapVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a mapping of {} entries", self.0.len())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut mapping = Mapping::with_capacity(self.0.len());
        for (key_shape, value_shape) in self.0 {
            let key = match map.next_key_seed(ShapedSeed(key_shape))? {
                Some(key) => key,
                None => return Err(de::Error::invalid_length(mapping.len(), &self)),
            };
            if mapping.contains_key(&key) {
                return Err(de::Error::custom(format!(
                    "duplicate entry with key {}",
                    describe(&key)
                )));
            }
            let value = map.next_value_seed(ShapedSeed(value_shape))?;
            mapping.insert(key, value);
        }
        Ok(Value::Mapping(mapping))
    }
}

struct TaggedVisitor<'a>(&'a Shape);

impl<'de> Visitor<'de> for TaggedVisitor<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a tagged node")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Value, A::Error> {
        let (tag, contents): (String, _) = data.variant()?;
        let value = contents.newtype_variant_seed(ShapedSeed(self.0))?;
        Ok(Value::Tagged(Box::new(TaggedValue {
            tag: Tag::new(tag),
            value,
        })))
    }
}

fn describe(key: &Value) -> String {
    match key {
        Value::String(s) => format!("\"{}\"", s),
        other => format!("{:?}", other),
    }
}
