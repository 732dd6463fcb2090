//! Merge policies.
//!
//! A save detects a conflict when the store's version of a row differs from
//! the version the saving context last saw. The context's [`MergePolicy`]
//! then decides what gets written, given three rows:
//!
//! - `local`: the values the context wants to write
//! - `store`: the row as it is in the store now
//! - `snapshot`: the committed row the context's changes are based on
//!
//! Absent attributes read as `Null` everywhere.

use crate::row::{Row, RowValues};
use faultdb_codec::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A policy's refusal to resolve a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRejection {
    /// Why the conflict was not resolved.
    pub reason: String,
}

impl MergeRejection {
    /// Creates a rejection.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MergeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Resolves a write-write conflict found at save time.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Produces the values to write, or rejects the save.
    ///
    /// # Errors
    ///
    /// Returns a [`MergeRejection`] when the conflict must be reported.
    fn resolve(&self, local: &Row, store: &Row, snapshot: &Row) -> Result<RowValues, MergeRejection>;

    /// Whether a store-side deletion silently wins over a local update, and a
    /// local deletion over a store-side update. When false, both are
    /// reported as conflicts.
    fn deletion_wins(&self) -> bool {
        true
    }
}

fn value_of<'a>(row: &'a Row, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

fn attribute_names<'a>(rows: [&'a Row; 3]) -> BTreeSet<&'a str> {
    rows.iter()
        .flat_map(|row| row.values().keys().map(String::as_str))
        .collect()
}

/// Rejects every conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fail;

impl MergePolicy for Fail {
    fn resolve(&self, _: &Row, store: &Row, snapshot: &Row) -> Result<RowValues, MergeRejection> {
        Err(MergeRejection::new(format!(
            "store moved from version {} to {}",
            snapshot.version().0,
            store.version().0
        )))
    }

    fn deletion_wins(&self) -> bool {
        false
    }
}

/// Discards the local changes and keeps the store row.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreWins;

impl MergePolicy for StoreWins {
    fn resolve(&self, _: &Row, store: &Row, _: &Row) -> Result<RowValues, MergeRejection> {
        Ok(store.values().clone())
    }
}

/// Overwrites the store row with the local values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl MergePolicy for LocalWins {
    fn resolve(&self, local: &Row, _: &Row, _: &Row) -> Result<RowValues, MergeRejection> {
        Ok(local.values().clone())
    }
}

/// Property-by-property merge.
///
/// An attribute changed on only one side since the snapshot keeps that side's
/// value. An attribute changed on both sides takes the store's value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyStoreWins;

/// Property-by-property merge.
///
/// An attribute changed on only one side since the snapshot keeps that side's
/// value. An attribute changed on both sides takes the local value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyLocalWins;

/// Merges `local` and `store` against `snapshot` attribute by attribute.
///
/// `prefer_local` picks the side for attributes changed on both.
#[must_use]
pub fn merge_properties(local: &Row, store: &Row, snapshot: &Row, prefer_local: bool) -> RowValues {
    let mut merged = RowValues::new();
    for name in attribute_names([local, store, snapshot]) {
        let base = value_of(snapshot, name);
        let ours = value_of(local, name);
        let theirs = value_of(store, name);
        let value = match (ours != base, theirs != base) {
            (true, true) if prefer_local => ours,
            (true, true) => theirs,
            (true, false) => ours,
            (false, _) => theirs,
        };
        if local.get(name).is_some() || store.get(name).is_some() || !value.is_null() {
            merged.insert(name.to_string(), value.clone());
        }
    }
    merged
}

impl MergePolicy for PropertyStoreWins {
    fn resolve(&self, local: &Row, store: &Row, snapshot: &Row) -> Result<RowValues, MergeRejection> {
        Ok(merge_properties(local, store, snapshot, false))
    }
}

impl MergePolicy for PropertyLocalWins {
    fn resolve(&self, local: &Row, store: &Row, snapshot: &Row) -> Result<RowValues, MergeRejection> {
        Ok(merge_properties(local, store, snapshot, true))
    }
}

/// Keeps whichever whole row has the greater value in `attribute`.
///
/// Typically used with a modification timestamp. Ties and incomparable values
/// go to the store.
#[derive(Debug, Clone)]
pub struct MostRecentWins {
    attribute: String,
}

impl MostRecentWins {
    /// Compares rows by `attribute`.
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl MergePolicy for MostRecentWins {
    fn resolve(&self, local: &Row, store: &Row, _: &Row) -> Result<RowValues, MergeRejection> {
        let ours = value_of(local, &self.attribute);
        let theirs = value_of(store, &self.attribute);
        if ours.cmp_total(theirs).is_gt() {
            Ok(local.values().clone())
        } else {
            Ok(store.values().clone())
        }
    }
}

/// Resolution function of a [`CustomMerge`].
pub type MergeFn = Arc<dyn Fn(&Row, &Row, &Row) -> Result<RowValues, MergeRejection> + Send + Sync>;

/// A policy built from a closure.
#[derive(Clone)]
pub struct CustomMerge {
    name: String,
    resolve: MergeFn,
    deletion_wins: bool,
}

impl CustomMerge {
    /// Wraps `resolve` under a display name.
    pub fn new<F>(name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&Row, &Row, &Row) -> Result<RowValues, MergeRejection> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            resolve: Arc::new(resolve),
            deletion_wins: true,
        }
    }

    /// Reports delete-versus-update divergences as conflicts.
    #[must_use]
    pub fn reject_deletion_conflicts(mut self) -> Self {
        self.deletion_wins = false;
        self
    }
}

impl fmt::Debug for CustomMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomMerge")
            .field("name", &self.name)
            .field("deletion_wins", &self.deletion_wins)
            .finish_non_exhaustive()
    }
}

impl MergePolicy for CustomMerge {
    fn resolve(&self, local: &Row, store: &Row, snapshot: &Row) -> Result<RowValues, MergeRejection> {
        (self.resolve)(local, store, snapshot)
    }

    fn deletion_wins(&self) -> bool {
        self.deletion_wins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VersionToken;

    fn row(pairs: &[(&str, Value)], version: u64) -> Row {
        Row::new(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            VersionToken(version),
        )
    }

    fn three() -> (Row, Row, Row) {
        let snapshot = row(
            &[("name", "France".into()), ("code", 250.into()), ("motto", "a".into())],
            1,
        );
        let store = row(
            &[("name", "République".into()), ("code", 250.into()), ("motto", "s".into())],
            2,
        );
        let local = row(
            &[("name", "France".into()), ("code", 251.into()), ("motto", "l".into())],
            1,
        );
        (local, store, snapshot)
    }

    #[test]
    fn property_merges_keep_one_sided_changes() {
        let (local, store, snapshot) = three();
        let merged = PropertyLocalWins.resolve(&local, &store, &snapshot).unwrap();
        assert_eq!(merged["name"], Value::from("République"));
        assert_eq!(merged["code"], Value::Integer(251));
        assert_eq!(merged["motto"], Value::from("l"));

        let merged = PropertyStoreWins.resolve(&local, &store, &snapshot).unwrap();
        assert_eq!(merged["name"], Value::from("République"));
        assert_eq!(merged["code"], Value::Integer(251));
        assert_eq!(merged["motto"], Value::from("s"));
    }

    #[test]
    fn whole_row_policies() {
        let (local, store, snapshot) = three();
        assert_eq!(&StoreWins.resolve(&local, &store, &snapshot).unwrap(), store.values());
        assert_eq!(&LocalWins.resolve(&local, &store, &snapshot).unwrap(), local.values());
        assert!(Fail.resolve(&local, &store, &snapshot).is_err());
        assert!(!Fail.deletion_wins());
        assert!(StoreWins.deletion_wins());
    }

    #[test]
    fn added_attribute_on_one_side_survives() {
        let snapshot = row(&[("name", "France".into())], 1);
        let store = row(&[("name", "France".into()), ("capital", "Paris".into())], 2);
        let local = row(&[("name", "Francia".into())], 1);
        let merged = PropertyLocalWins.resolve(&local, &store, &snapshot).unwrap();
        assert_eq!(merged["capital"], Value::from("Paris"));
        assert_eq!(merged["name"], Value::from("Francia"));
    }

    #[test]
    fn most_recent_wins_compares_attribute() {
        let snapshot = row(&[("at", Value::Timestamp(1))], 1);
        let store = row(&[("at", Value::Timestamp(5)), ("v", "store".into())], 2);
        let local = row(&[("at", Value::Timestamp(9)), ("v", "local".into())], 1);
        let policy = MostRecentWins::new("at");
        assert_eq!(policy.resolve(&local, &store, &snapshot).unwrap()["v"], Value::from("local"));
        assert_eq!(policy.resolve(&store, &store, &snapshot).unwrap()["v"], Value::from("store"));
    }

    #[test]
    fn custom_merge_delegates() {
        let policy = CustomMerge::new("refuse", |_, _, _| Err(MergeRejection::new("no")))
            .reject_deletion_conflicts();
        let (local, store, snapshot) = three();
        assert_eq!(
            policy.resolve(&local, &store, &snapshot),
            Err(MergeRejection::new("no"))
        );
        assert!(!policy.deletion_wins());
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        const NAMES: [&str; 4] = ["name", "code", "motto", "founded"];

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                (0i64..4).prop_map(Value::Integer),
                "[a-c]{0,2}".prop_map(Value::Text),
            ]
        }

        fn arb_row() -> impl Strategy<Value = Row> {
            prop::collection::btree_map(prop::sample::select(NAMES.to_vec()), arb_value(), 0..4)
                .prop_map(|values| {
                    Row::new(
                        values.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
                        VersionToken(1),
                    )
                })
        }

        fn at(values: &RowValues, name: &str) -> Value {
            values.get(name).cloned().unwrap_or(Value::Null)
        }

        proptest! {
            #[test]
            fn untouched_local_takes_the_store(store in arb_row(), snapshot in arb_row(), prefer in any::<bool>()) {
                let merged = merge_properties(&snapshot, &store, &snapshot, prefer);
                for name in NAMES {
                    prop_assert_eq!(at(&merged, name), value_of(&store, name).clone());
                }
            }

            #[test]
            fn untouched_store_keeps_local(local in arb_row(), snapshot in arb_row(), prefer in any::<bool>()) {
                let merged = merge_properties(&local, &snapshot, &snapshot, prefer);
                for name in NAMES {
                    prop_assert_eq!(at(&merged, name), value_of(&local, name).clone());
                }
            }

            #[test]
            fn each_attribute_comes_from_the_side_that_changed_it(
                local in arb_row(),
                store in arb_row(),
                snapshot in arb_row(),
            ) {
                let local_wins = PropertyLocalWins.resolve(&local, &store, &snapshot).unwrap();
                let store_wins = PropertyStoreWins.resolve(&local, &store, &snapshot).unwrap();
                for name in NAMES {
                    let base = value_of(&snapshot, name);
                    let ours = value_of(&local, name);
                    let theirs = value_of(&store, name);
                    match (ours != base, theirs != base) {
                        (true, true) => {
                            prop_assert_eq!(&at(&local_wins, name), ours);
                            prop_assert_eq!(&at(&store_wins, name), theirs);
                        }
                        (true, false) => {
                            prop_assert_eq!(&at(&local_wins, name), ours);
                            prop_assert_eq!(&at(&store_wins, name), ours);
                        }
                        (false, _) => {
                            prop_assert_eq!(&at(&local_wins, name), theirs);
                            prop_assert_eq!(&at(&store_wins, name), theirs);
                        }
                    }
                }
            }

            #[test]
            fn whole_row_policies_pick_one_side(local in arb_row(), store in arb_row(), snapshot in arb_row()) {
                prop_assert_eq!(&LocalWins.resolve(&local, &store, &snapshot).unwrap(), local.values());
                prop_assert_eq!(&StoreWins.resolve(&local, &store, &snapshot).unwrap(), store.values());
                prop_assert!(Fail.resolve(&local, &store, &snapshot).is_err());
            }
        }
    }
}
