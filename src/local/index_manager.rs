use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::filter::value_matches;
use crate::core::{Direction, FieldFilter, FilterOperator, Target};
use crate::error::FirestoreResult;
use crate::local::index_value_writer::{encode_segment, encode_value};
use crate::local::kv_store::{DbKey, KeyPart, KeyRange, Table};
use crate::local::persistence::{path_from_key, prefixed_path_key, Transaction};
use crate::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexOffset, IndexSegment, IndexState, MutableDocument,
    ResourcePath, User,
};
use crate::value::FirestoreValue;

const GLOBAL_HIGHEST_INDEX_ID: &str = "highest_index_id";
const GLOBAL_INDEX_SEQUENCE_NUMBER: &str = "index_sequence_number";

/// How well the best available index serves a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No usable index.
    None,
    /// An index narrows the candidates, but results must be filtered and
    /// the limit applied after reading documents.
    Partial,
    /// An index covers every filter and ordering of the target.
    Full,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexConfigurationRow {
    collection_group: String,
    segments: Vec<IndexSegment>,
}

/// Directional values of one index entry, kept for filtering scans.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntryRow {
    values: Vec<FirestoreValue>,
}

/// Field indexes over the remote documents and local overlays of one user.
pub struct IndexManager {
    user_key: String,
}

impl IndexManager {
    pub fn new(user: &User) -> Self {
        Self {
            user_key: user.storage_key(),
        }
    }

    /// Records that `collection_path` holds documents, so collection group
    /// queries can find it.
    pub fn add_to_collection_parent_index(
        txn: &mut Transaction<'_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let key = prefixed_path_key(vec![KeyPart::from(collection_id)], &collection_path.without_last());
        if !txn.contains(Table::CollectionParents, &key)? {
            txn.put(Table::CollectionParents, key, &())?;
        }
        Ok(())
    }

    /// Parent paths of every known collection named `collection_id`.
    pub fn get_collection_parents(txn: &Transaction<'_>, collection_id: &str) -> FirestoreResult<Vec<ResourcePath>> {
        Ok(txn
            .scan_keys(
                Table::CollectionParents,
                &KeyRange::prefix(vec![KeyPart::from(collection_id)]),
            )?
            .into_iter()
            .map(|key| path_from_key(&key, 1))
            .collect())
    }

    fn state_key(&self, index_id: i32) -> DbKey {
        vec![KeyPart::from(index_id), KeyPart::from(self.user_key.as_str())]
    }

    /// Persists a new index definition and returns it with its assigned id.
    /// Its entries are written by later backfills.
    pub fn add_field_index(&self, txn: &mut Transaction<'_>, index: &FieldIndex) -> FirestoreResult<FieldIndex> {
        let index_id = txn.get_global::<i32>(GLOBAL_HIGHEST_INDEX_ID)?.unwrap_or(0) + 1;
        txn.put_global(GLOBAL_HIGHEST_INDEX_ID, &index_id)?;
        txn.put(
            Table::IndexConfiguration,
            vec![KeyPart::from(index_id)],
            &IndexConfigurationRow {
                collection_group: index.collection_group.clone(),
                segments: index.segments.clone(),
            },
        )?;
        txn.put(Table::IndexState, self.state_key(index_id), &index.index_state)?;
        log::debug!("created index {index_id} on collection group '{}'", index.collection_group);
        Ok(index.clone().with_id(index_id))
    }

    pub fn delete_field_index(&self, txn: &mut Transaction<'_>, index: &FieldIndex) -> FirestoreResult<()> {
        let id_prefix = vec![KeyPart::from(index.index_id)];
        txn.delete(Table::IndexConfiguration, &id_prefix)?;
        txn.delete_range(Table::IndexState, &KeyRange::prefix(id_prefix.clone()))?;
        txn.delete_range(Table::IndexEntries, &KeyRange::prefix(id_prefix.clone()))?;
        txn.delete_range(Table::DocumentIndexEntries, &KeyRange::prefix(id_prefix))?;
        Ok(())
    }

    /// Every index, or those of `collection_group`, with this user's state.
    pub fn get_field_indexes(
        &self,
        txn: &Transaction<'_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        let mut indexes = Vec::new();
        for (key, row) in txn.scan::<IndexConfigurationRow>(Table::IndexConfiguration, &KeyRange::all())? {
            if collection_group.is_some_and(|group| group != row.collection_group) {
                continue;
            }
            let Some(KeyPart::Int(index_id)) = key.first() else {
                continue;
            };
            let index_id = *index_id as i32;
            let state = txn
                .get::<IndexState>(Table::IndexState, &self.state_key(index_id))?
                .unwrap_or_else(IndexState::empty);
            indexes.push(
                FieldIndex::new(row.collection_group, row.segments)
                    .with_id(index_id)
                    .with_state(state),
            );
        }
        Ok(indexes)
    }

    /// The index serving the most segments of `target`, if any serves it.
    pub fn get_field_index(&self, txn: &Transaction<'_>, target: &Target) -> FirestoreResult<Option<FieldIndex>> {
        if target.has_disjunction() {
            return Ok(None);
        }
        let Some(group) = target.collection_group_id() else {
            return Ok(None);
        };
        Ok(self
            .get_field_indexes(txn, Some(group))?
            .into_iter()
            .filter(|index| serves_target(index, target))
            .max_by_key(|index| index.segments.len()))
    }

    pub fn get_index_type(&self, txn: &Transaction<'_>, target: &Target) -> FirestoreResult<IndexType> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(IndexType::None);
        };
        if index.segments.len() < required_segment_count(target) {
            Ok(IndexType::Partial)
        } else {
            Ok(IndexType::Full)
        }
    }

    /// Keys of the indexed documents that may match `target`, or `None` when
    /// no index serves it.
    pub fn get_documents_matching_target(
        &self,
        txn: &Transaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<Vec<DocumentKey>>> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(None);
        };
        let filters = target.field_filters();
        let directional: Vec<&IndexSegment> = index.directional_segments().collect();

        let array_values: Vec<Option<&FirestoreValue>> = match index.array_segment() {
            Some(segment) => match target.array_filter().filter(|filter| filter.field() == &segment.field_path) {
                Some(filter) if filter.op() == FilterOperator::ArrayContains => vec![Some(filter.value())],
                Some(filter) => filter
                    .value()
                    .as_array()
                    .map(|array| array.values().iter().map(Some).collect())
                    .unwrap_or_default(),
                None => return Ok(None),
            },
            None => vec![None],
        };

        // Leading segments pinned by a single equality value narrow the scan.
        let mut equality_prefix = Vec::new();
        for segment in &directional {
            let equal = filters
                .iter()
                .find(|filter| filter.field() == &segment.field_path && filter.op() == FilterOperator::Equal);
            match equal {
                Some(filter) => equality_prefix.push(KeyPart::Bytes(encode_segment(filter.value(), segment.kind))),
                None => break,
            }
        }

        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for array_value in array_values {
            let mut prefix = self.entry_prefix(&index, array_value);
            prefix.extend(equality_prefix.iter().cloned());
            for (row_key, row) in txn.scan::<IndexEntryRow>(Table::IndexEntries, &KeyRange::prefix(prefix))? {
                if !entry_matches(&directional, &filters, &row.values) {
                    continue;
                }
                let Some(KeyPart::Str(path)) = row_key.last() else {
                    continue;
                };
                let key = DocumentKey::from_string(path)?;
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(Some(keys))
    }

    fn entry_prefix(&self, index: &FieldIndex, array_value: Option<&FirestoreValue>) -> DbKey {
        vec![
            KeyPart::from(index.index_id),
            KeyPart::from(self.user_key.as_str()),
            KeyPart::Bytes(array_value.map(encode_value).unwrap_or_default()),
        ]
    }

    /// Collection group whose indexes were backfilled least recently.
    pub fn get_next_collection_group_to_update(&self, txn: &Transaction<'_>) -> FirestoreResult<Option<String>> {
        Ok(self
            .get_field_indexes(txn, None)?
            .into_iter()
            .min_by_key(|index| (index.index_state.sequence_number, index.index_id))
            .map(|index| index.collection_group))
    }

    /// Marks every index of `collection_group` as backfilled up to `offset`.
    pub fn update_collection_group(
        &self,
        txn: &mut Transaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
    ) -> FirestoreResult<()> {
        let sequence_number = txn.get_global::<i64>(GLOBAL_INDEX_SEQUENCE_NUMBER)?.unwrap_or(0) + 1;
        txn.put_global(GLOBAL_INDEX_SEQUENCE_NUMBER, &sequence_number)?;
        for index in self.get_field_indexes(txn, Some(collection_group))? {
            txn.put(
                Table::IndexState,
                self.state_key(index.index_id),
                &IndexState::new(sequence_number, offset.clone()),
            )?;
        }
        Ok(())
    }

    /// Rewrites the index entries of `documents` for every index on their
    /// collection groups.
    pub fn update_index_entries<'d, I>(&self, txn: &mut Transaction<'_>, documents: I) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'d MutableDocument>,
    {
        let mut indexes_by_group: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for document in documents {
            let group = document.key().collection_group().to_string();
            if !indexes_by_group.contains_key(&group) {
                let indexes = self.get_field_indexes(txn, Some(&group))?;
                indexes_by_group.insert(group.clone(), indexes);
            }
            for index in indexes_by_group.get(&group).into_iter().flatten() {
                self.replace_entries(txn, index, document)?;
            }
        }
        Ok(())
    }

    fn replace_entries(
        &self,
        txn: &mut Transaction<'_>,
        index: &FieldIndex,
        document: &MutableDocument,
    ) -> FirestoreResult<()> {
        let owner_key = prefixed_path_key(
            vec![KeyPart::from(index.index_id), KeyPart::from(self.user_key.as_str())],
            document.key().path(),
        );
        if let Some(previous) = txn.get::<Vec<DbKey>>(Table::DocumentIndexEntries, &owner_key)? {
            for entry in &previous {
                txn.delete(Table::IndexEntries, entry)?;
            }
        }

        let entries = self.compute_entries(index, document);
        if entries.is_empty() {
            txn.delete(Table::DocumentIndexEntries, &owner_key)?;
            return Ok(());
        }
        let mut entry_keys = Vec::with_capacity(entries.len());
        for (entry_key, row) in entries {
            txn.put(Table::IndexEntries, entry_key.clone(), &row)?;
            entry_keys.push(entry_key);
        }
        txn.put(Table::DocumentIndexEntries, owner_key, &entry_keys)
    }

    fn compute_entries(&self, index: &FieldIndex, document: &MutableDocument) -> Vec<(DbKey, IndexEntryRow)> {
        if !document.is_found_document() {
            return Vec::new();
        }
        let mut values = Vec::new();
        let mut encoded = Vec::new();
        for segment in index.directional_segments() {
            let Some(value) = document.field(&segment.field_path) else {
                return Vec::new();
            };
            encoded.push(KeyPart::Bytes(encode_segment(value, segment.kind)));
            values.push(value.clone());
        }

        let array_elements: Vec<Option<&FirestoreValue>> = match index.array_segment() {
            Some(segment) => match document.field(&segment.field_path).and_then(FirestoreValue::as_array) {
                Some(array) => array.values().iter().map(Some).collect(),
                None => return Vec::new(),
            },
            None => vec![None],
        };

        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for element in array_elements {
            let mut key = self.entry_prefix(index, element);
            if !seen.insert(key.clone()) {
                continue;
            }
            key.extend(encoded.iter().cloned());
            key.push(KeyPart::Str(document.key().path().canonical_string()));
            entries.push((key, IndexEntryRow { values: values.clone() }));
        }
        entries
    }

    /// Smallest backfill offset among the indexes of `collection_group`.
    pub fn get_min_offset_for_group(&self, txn: &Transaction<'_>, collection_group: &str) -> FirestoreResult<IndexOffset> {
        Ok(self
            .get_field_indexes(txn, Some(collection_group))?
            .into_iter()
            .map(|index| index.index_state.offset)
            .min()
            .unwrap_or_else(IndexOffset::none))
    }

    /// Offset up to which the index serving `target` is complete.
    pub fn get_min_offset(&self, txn: &Transaction<'_>, target: &Target) -> FirestoreResult<IndexOffset> {
        match self.get_field_index(txn, target)? {
            Some(index) => Ok(index.index_state.offset),
            None => Ok(IndexOffset::none()),
        }
    }

    /// Creates the index that would fully serve `target`, unless an
    /// equivalent one exists.
    pub fn create_target_indexes(&self, txn: &mut Transaction<'_>, target: &Target) -> FirestoreResult<()> {
        if target.has_disjunction() {
            return Ok(());
        }
        let Some(group) = target.collection_group_id() else {
            return Ok(());
        };
        let Some(wanted) = index_for_target(group, target) else {
            return Ok(());
        };
        let exists = self
            .get_field_indexes(txn, Some(group))?
            .iter()
            .any(|index| index.segments == wanted.segments);
        if !exists {
            self.add_field_index(txn, &wanted)?;
        }
        Ok(())
    }
}

fn is_equality(filter: &FieldFilter) -> bool {
    matches!(filter.op(), FilterOperator::Equal | FilterOperator::In)
}

fn direction_kind(direction: Direction) -> IndexKind {
    match direction {
        Direction::Ascending => IndexKind::Ascending,
        Direction::Descending => IndexKind::Descending,
    }
}

/// Whether every segment of `index` can be used for `target`: equality
/// fields first, then the target's orderings in sequence.
fn serves_target(index: &FieldIndex, target: &Target) -> bool {
    if Some(index.collection_group.as_str()) != target.collection_group_id() {
        return false;
    }
    let filters = target.field_filters();
    match (index.array_segment(), target.array_filter()) {
        (Some(segment), Some(filter)) if segment.field_path == *filter.field() => {}
        (None, _) => {}
        _ => return false,
    }

    let equality_fields: BTreeSet<&FieldPath> = filters
        .iter()
        .filter(|filter| is_equality(filter))
        .map(|filter| filter.field())
        .collect();
    let mut segments = index.directional_segments().peekable();
    while let Some(segment) = segments.peek() {
        if !equality_fields.contains(&segment.field_path) {
            break;
        }
        segments.next();
    }

    let mut orderings = target
        .order_by()
        .iter()
        .filter(|order| !order.field().is_key_field() && !equality_fields.contains(order.field()));
    for segment in segments {
        match orderings.next() {
            Some(order)
                if order.field() == &segment.field_path && direction_kind(order.direction()) == segment.kind => {}
            _ => return false,
        }
    }
    true
}

/// Number of segments an index needs to serve `target` fully.
fn required_segment_count(target: &Target) -> usize {
    let filters = target.field_filters();
    let mut fields: BTreeSet<&FieldPath> = filters
        .iter()
        .filter(|filter| !filter.op().is_array_membership() && !filter.field().is_key_field())
        .map(|filter| filter.field())
        .collect();
    for order in target.order_by() {
        if !order.field().is_key_field() {
            fields.insert(order.field());
        }
    }
    fields.len() + usize::from(target.array_filter().is_some())
}

fn index_for_target(group: &str, target: &Target) -> Option<FieldIndex> {
    let filters = target.field_filters();
    let mut segments = Vec::new();
    let mut used = BTreeSet::new();
    for filter in &filters {
        if is_equality(filter) && !filter.field().is_key_field() && used.insert(filter.field().clone()) {
            segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Ascending));
        }
    }
    for order in target.order_by() {
        if !order.field().is_key_field() && used.insert(order.field().clone()) {
            segments.push(IndexSegment::new(order.field().clone(), direction_kind(order.direction())));
        }
    }
    if let Some(filter) = target.array_filter() {
        segments.push(IndexSegment::new(filter.field().clone(), IndexKind::Contains));
    }
    if segments.is_empty() {
        return None;
    }
    Some(FieldIndex::new(group, segments))
}

fn entry_matches(segments: &[&IndexSegment], filters: &[&FieldFilter], values: &[FirestoreValue]) -> bool {
    segments.iter().zip(values).all(|(segment, value)| {
        filters
            .iter()
            .filter(|filter| filter.field() == &segment.field_path && !filter.op().is_array_membership())
            .all(|filter| value_matches(filter, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Filter, OrderBy, Query};
    use crate::local::kv_store::TransactionMode;
    use crate::local::persistence::Persistence;
    use crate::model::SnapshotVersion;
    use crate::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (name, value) in fields {
            data.set(&field(name), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn collection_parents_are_tracked_once() {
        let persistence = Persistence::memory("c");
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                let path = ResourcePath::from_string("rooms/a/msgs").unwrap();
                IndexManager::add_to_collection_parent_index(txn, &path)?;
                IndexManager::add_to_collection_parent_index(txn, &path)?;
                IndexManager::add_to_collection_parent_index(txn, &ResourcePath::from_string("msgs").unwrap())?;
                let parents = IndexManager::get_collection_parents(txn, "msgs")?;
                assert_eq!(parents, vec![ResourcePath::root(), ResourcePath::from_string("rooms/a").unwrap()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn index_lookup_filters_entries() {
        let persistence = Persistence::memory("c");
        let manager = IndexManager::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                manager.add_field_index(
                    txn,
                    &FieldIndex::new(
                        "rooms",
                        vec![
                            IndexSegment::new(field("kind"), IndexKind::Ascending),
                            IndexSegment::new(field("size"), IndexKind::Ascending),
                        ],
                    ),
                )?;
                let documents = vec![
                    doc("rooms/a", &[("kind", FirestoreValue::from_string("x")), ("size", FirestoreValue::from_integer(1))]),
                    doc("rooms/b", &[("kind", FirestoreValue::from_string("x")), ("size", FirestoreValue::from_integer(5))]),
                    doc("rooms/c", &[("kind", FirestoreValue::from_string("y")), ("size", FirestoreValue::from_integer(9))]),
                    doc("rooms/d", &[("kind", FirestoreValue::from_string("x"))]),
                ];
                manager.update_index_entries(txn, documents.iter())?;

                let target = rooms()
                    .with_filter(Filter::field(field("kind"), FilterOperator::Equal, FirestoreValue::from_string("x"))?)
                    .with_filter(Filter::field(field("size"), FilterOperator::GreaterThan, FirestoreValue::from_integer(2))?)
                    .to_target();
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::Full);
                let keys = manager.get_documents_matching_target(txn, &target)?.unwrap();
                assert_eq!(keys, vec![DocumentKey::from_string("rooms/b").unwrap()]);

                // A changed document drops its stale entry.
                let moved = doc("rooms/b", &[("kind", FirestoreValue::from_string("y")), ("size", FirestoreValue::from_integer(5))]);
                manager.update_index_entries(txn, [&moved])?;
                assert!(manager.get_documents_matching_target(txn, &target)?.unwrap().is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn array_contains_uses_the_array_segment() {
        let persistence = Persistence::memory("c");
        let manager = IndexManager::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                manager.add_field_index(
                    txn,
                    &FieldIndex::new("rooms", vec![IndexSegment::new(field("tags"), IndexKind::Contains)]),
                )?;
                let tags = |values: &[&str]| {
                    FirestoreValue::from_array(values.iter().map(|v| FirestoreValue::from_string(*v)).collect())
                };
                let documents = vec![
                    doc("rooms/a", &[("tags", tags(&["red", "blue"]))]),
                    doc("rooms/b", &[("tags", tags(&["green"]))]),
                ];
                manager.update_index_entries(txn, documents.iter())?;
                let target = rooms()
                    .with_filter(Filter::field(field("tags"), FilterOperator::ArrayContains, FirestoreValue::from_string("blue"))?)
                    .to_target();
                let keys = manager.get_documents_matching_target(txn, &target)?.unwrap();
                assert_eq!(keys, vec![DocumentKey::from_string("rooms/a").unwrap()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn partial_and_missing_indexes() {
        let persistence = Persistence::memory("c");
        let manager = IndexManager::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                let target = rooms()
                    .with_filter(Filter::field(field("a"), FilterOperator::Equal, FirestoreValue::from_integer(1))?)
                    .with_order_by(OrderBy::ascending(field("b")))
                    .to_target();
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::None);

                manager.add_field_index(
                    txn,
                    &FieldIndex::new("rooms", vec![IndexSegment::new(field("a"), IndexKind::Ascending)]),
                )?;
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::Partial);

                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_index_type(txn, &target)?, IndexType::Full);
                manager.create_target_indexes(txn, &target)?;
                assert_eq!(manager.get_field_indexes(txn, Some("rooms"))?.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn backfill_bookkeeping_rotates_groups() {
        let persistence = Persistence::memory("c");
        let manager = IndexManager::new(&User::anonymous());
        persistence
            .run_transaction("t", TransactionMode::ReadWrite, |txn| {
                let asc = |name: &str| vec![IndexSegment::new(field(name), IndexKind::Ascending)];
                manager.add_field_index(txn, &FieldIndex::new("rooms", asc("a")))?;
                manager.add_field_index(txn, &FieldIndex::new("halls", asc("a")))?;
                assert_eq!(manager.get_next_collection_group_to_update(txn)?.as_deref(), Some("rooms"));

                let offset = IndexOffset::successor_of_read_time(SnapshotVersion::from_micros(5), 3);
                manager.update_collection_group(txn, "rooms", offset.clone())?;
                assert_eq!(manager.get_next_collection_group_to_update(txn)?.as_deref(), Some("halls"));
                assert_eq!(manager.get_min_offset_for_group(txn, "rooms")?, offset);
                Ok(())
            })
            .unwrap();
    }
}
