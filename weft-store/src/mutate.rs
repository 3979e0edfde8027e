//! Value mutation helpers shared by every backend
//!
//! Mutations on an absent key materialize it: increments start from zero,
//! set and vector operations start from an empty container. A stored value
//! of the wrong shape yields `ShapeMismatch`.

use std::collections::BTreeSet;
use weft_model::Data;

/// The stored value cannot be mutated this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeMismatch;

pub fn increment(value: Option<Data>, by: i64) -> Result<Data, ShapeMismatch> {
    match value {
        None => Ok(Data::Integer(by)),
        Some(Data::Integer(i)) => Ok(Data::Integer(i.saturating_add(by))),
        Some(Data::Count(c)) => {
            let next = if by >= 0 {
                c.saturating_add(by as u64)
            } else {
                c.saturating_sub(by.unsigned_abs())
            };
            Ok(Data::Count(next))
        }
        Some(_) => Err(ShapeMismatch),
    }
}

pub fn add_to_set(value: Option<Data>, element: Data) -> Result<Data, ShapeMismatch> {
    match value {
        None => {
            let mut set = BTreeSet::new();
            set.insert(element);
            Ok(Data::Set(set))
        }
        Some(Data::Set(mut set)) => {
            set.insert(element);
            Ok(Data::Set(set))
        }
        Some(_) => Err(ShapeMismatch),
    }
}

pub fn remove_from_set(value: Option<Data>, element: &Data) -> Result<Data, ShapeMismatch> {
    match value {
        None => Ok(Data::Set(BTreeSet::new())),
        Some(Data::Set(mut set)) => {
            set.remove(element);
            Ok(Data::Set(set))
        }
        Some(_) => Err(ShapeMismatch),
    }
}

pub fn push_front(value: Option<Data>, items: Vec<Data>) -> Result<Data, ShapeMismatch> {
    match value {
        None => Ok(Data::Vector(items)),
        Some(Data::Vector(mut v)) => {
            let mut items = items;
            items.append(&mut v);
            Ok(Data::Vector(items))
        }
        Some(_) => Err(ShapeMismatch),
    }
}

pub fn push_back(value: Option<Data>, items: Vec<Data>) -> Result<Data, ShapeMismatch> {
    match value {
        None => Ok(Data::Vector(items)),
        Some(Data::Vector(mut v)) => {
            v.extend(items);
            Ok(Data::Vector(v))
        }
        Some(_) => Err(ShapeMismatch),
    }
}

/// Returns the remaining vector and the popped item. Popping an empty
/// vector succeeds with no item.
pub fn pop_front(value: Data) -> Result<(Data, Option<Data>), ShapeMismatch> {
    match value {
        Data::Vector(mut v) => {
            if v.is_empty() {
                Ok((Data::Vector(v), None))
            } else {
                let item = v.remove(0);
                Ok((Data::Vector(v), Some(item)))
            }
        }
        _ => Err(ShapeMismatch),
    }
}

pub fn pop_back(value: Data) -> Result<(Data, Option<Data>), ShapeMismatch> {
    match value {
        Data::Vector(mut v) => {
            let item = v.pop();
            Ok((Data::Vector(v), item))
        }
        _ => Err(ShapeMismatch),
    }
}
