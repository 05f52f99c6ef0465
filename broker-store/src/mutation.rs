//! Command application shared by master and clone stores.
//!
//! Masters and clones must derive identical contents from identical command
//! sequences, so the actual mutation logic lives here and both sides call it.

use broker_core::{Command, Data};
use std::collections::BTreeMap;

/// Why a mutation was rejected. Rejections are logged and become no-ops;
/// they never propagate.
pub(crate) type MutationError = String;

/// Apply a plain mutation to store contents. `PutUnique` never reaches this
/// point: the master realizes it as a `Put` (or nothing) before broadcasting.
pub(crate) fn apply_mutation(
    store: &mut BTreeMap<Data, Data>,
    cmd: &Command,
) -> Result<(), MutationError> {
    match cmd {
        Command::Put { key, value, .. } => {
            store.insert(key.clone(), value.clone());
            Ok(())
        },
        Command::Erase { key } => {
            store.remove(key);
            Ok(())
        },
        Command::Add { key, delta } => modify(store, key, delta, add_value),
        Command::Subtract { key, delta } => modify(store, key, delta, subtract_value),
        Command::Set { entries } => {
            *store = entries.clone();
            Ok(())
        },
        Command::Clear => {
            store.clear();
            Ok(())
        },
        other => Err(format!("{} is not a plain mutation", other.kind())),
    }
}

fn modify(
    store: &mut BTreeMap<Data, Data>,
    key: &Data,
    delta: &Data,
    op: fn(&mut Data, &Data) -> Result<(), MutationError>,
) -> Result<(), MutationError> {
    match store.get_mut(key) {
        Some(value) => op(value, delta),
        None => {
            // An absent key acts as the zero/empty value of the delta's kind.
            let mut value = empty_like(delta)?;
            op(&mut value, delta)?;
            store.insert(key.clone(), value);
            Ok(())
        },
    }
}

fn empty_like(delta: &Data) -> Result<Data, MutationError> {
    match delta {
        Data::Count(_) => Ok(Data::Count(0)),
        Data::Integer(_) => Ok(Data::Integer(0)),
        Data::Real(_) => Ok(Data::Real(0.0)),
        Data::Vector(_) => Ok(Data::Vector(Vec::new())),
        Data::Set(_) => Ok(Data::Set(Default::default())),
        Data::Table(_) => Ok(Data::Table(Default::default())),
        other => Err(format!("no zero value for {} delta", other.kind())),
    }
}

fn add_value(value: &mut Data, delta: &Data) -> Result<(), MutationError> {
    match (value, delta) {
        (Data::Count(a), Data::Count(b)) => {
            *a = a.saturating_add(*b);
            Ok(())
        },
        (Data::Integer(a), Data::Integer(b)) => {
            *a = a.saturating_add(*b);
            Ok(())
        },
        (Data::Real(a), Data::Real(b)) => {
            *a += b;
            Ok(())
        },
        (Data::Vector(xs), Data::Vector(ys)) => {
            xs.extend(ys.iter().cloned());
            Ok(())
        },
        (Data::Vector(xs), y) => {
            xs.push(y.clone());
            Ok(())
        },
        (Data::Set(xs), Data::Set(ys)) => {
            xs.extend(ys.iter().cloned());
            Ok(())
        },
        (Data::Set(xs), y) => {
            xs.insert(y.clone());
            Ok(())
        },
        (Data::Table(xs), Data::Table(ys)) => {
            for (k, v) in ys {
                xs.insert(k.clone(), v.clone());
            }
            Ok(())
        },
        (value, delta) => Err(format!("cannot add {} to {}", delta.kind(), value.kind())),
    }
}

fn subtract_value(value: &mut Data, delta: &Data) -> Result<(), MutationError> {
    match (value, delta) {
        (Data::Count(a), Data::Count(b)) => {
            *a = a.saturating_sub(*b);
            Ok(())
        },
        (Data::Integer(a), Data::Integer(b)) => {
            *a = a.saturating_sub(*b);
            Ok(())
        },
        (Data::Real(a), Data::Real(b)) => {
            *a -= b;
            Ok(())
        },
        (Data::Vector(_), _) => Err("vector subtraction is not supported".to_string()),
        (Data::Set(xs), Data::Set(ys)) => {
            for y in ys {
                xs.remove(y);
            }
            Ok(())
        },
        (Data::Set(xs), y) => {
            xs.remove(y);
            Ok(())
        },
        (Data::Table(xs), Data::Table(ys)) => {
            for k in ys.keys() {
                xs.remove(k);
            }
            Ok(())
        },
        (Data::Table(xs), Data::Set(ys)) => {
            for k in ys {
                xs.remove(k);
            }
            Ok(())
        },
        (value, delta) => {
            Err(format!("cannot subtract {} from {}", delta.kind(), value.kind()))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(key: Data, value: Data) -> BTreeMap<Data, Data> {
        [(key, value)].into()
    }

    #[test]
    fn test_add_to_numbers() {
        let mut store = store_with(Data::from("n"), Data::Count(2));
        apply_mutation(&mut store, &Command::Add { key: Data::from("n"), delta: Data::Count(3) })
            .unwrap();
        assert_eq!(store[&Data::from("n")], Data::Count(5));
    }

    #[test]
    fn test_add_to_absent_key_starts_from_zero() {
        let mut store = BTreeMap::new();
        apply_mutation(&mut store, &Command::Add { key: Data::from("n"), delta: Data::Integer(-4) })
            .unwrap();
        assert_eq!(store[&Data::from("n")], Data::Integer(-4));
    }

    #[test]
    fn test_add_appends_to_vectors_and_unions_sets() {
        let mut store = store_with(Data::from("v"), Data::Vector(vec![Data::Count(1)]));
        apply_mutation(&mut store, &Command::Add { key: Data::from("v"), delta: Data::Count(2) })
            .unwrap();
        assert_eq!(
            store[&Data::from("v")],
            Data::Vector(vec![Data::Count(1), Data::Count(2)])
        );

        let mut store = store_with(Data::from("s"), Data::Set([Data::from("a")].into()));
        apply_mutation(&mut store, &Command::Add {
            key: Data::from("s"),
            delta: Data::Set([Data::from("b"), Data::from("a")].into()),
        })
        .unwrap();
        assert_eq!(
            store[&Data::from("s")],
            Data::Set([Data::from("a"), Data::from("b")].into())
        );
    }

    #[test]
    fn test_type_mismatch_is_rejected_without_effect() {
        let mut store = store_with(Data::from("n"), Data::Count(2));
        let before = store.clone();
        let result = apply_mutation(&mut store, &Command::Add {
            key: Data::from("n"),
            delta: Data::from("oops"),
        });
        assert!(result.is_err());
        assert_eq!(store, before);
    }

    #[test]
    fn test_subtract_removes_keys_but_rejects_vectors() {
        let mut store = store_with(
            Data::from("t"),
            Data::Table([(Data::from("a"), Data::Count(1)), (Data::from("b"), Data::Count(2))].into()),
        );
        apply_mutation(&mut store, &Command::Subtract {
            key: Data::from("t"),
            delta: Data::Set([Data::from("a")].into()),
        })
        .unwrap();
        assert_eq!(
            store[&Data::from("t")],
            Data::Table([(Data::from("b"), Data::Count(2))].into())
        );

        let mut store = store_with(Data::from("v"), Data::Vector(vec![Data::Count(1)]));
        assert!(apply_mutation(&mut store, &Command::Subtract {
            key: Data::from("v"),
            delta: Data::Count(1),
        })
        .is_err());
    }

    #[test]
    fn test_count_subtraction_saturates_at_zero() {
        let mut store = store_with(Data::from("n"), Data::Count(1));
        apply_mutation(&mut store, &Command::Subtract {
            key: Data::from("n"),
            delta: Data::Count(5),
        })
        .unwrap();
        assert_eq!(store[&Data::from("n")], Data::Count(0));
    }

    #[test]
    fn test_set_and_clear_replace_contents() {
        let mut store = store_with(Data::from("a"), Data::Count(1));
        apply_mutation(&mut store, &Command::Set {
            entries: [(Data::from("b"), Data::Count(2))].into(),
        })
        .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store[&Data::from("b")], Data::Count(2));
        apply_mutation(&mut store, &Command::Clear).unwrap();
        assert!(store.is_empty());
    }
}
