// =============================================================================
// store/memory.rs: A DATABASE THAT FITS IN A BTREEMAP
// =============================================================================
//
// Same contract as the Postgres store, minus the network. Rows are kept in
// ordered maps so iteration order is stable and test assertions do not
// depend on hash seeds.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

use super::SubjectStore;
use crate::error::StoreResult;
use crate::models::{ActorId, Subject, SubjectId, SubjectKind};

#[derive(Default)]
struct Tables {
    subjects: BTreeMap<(SubjectKind, SubjectId), Subject>,
    likes: BTreeSet<(SubjectKind, SubjectId, ActorId)>,
}

#[derive(Default)]
pub struct MemorySubjectStore {
    tables: RwLock<Tables>,
}

impl MemorySubjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `subjects`, overwriting rows with the same key.
    pub fn with_subjects(subjects: impl IntoIterator<Item = Subject>) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for subject in subjects {
                tables.subjects.insert((subject.kind, subject.id), subject);
            }
        }
        store
    }

    /// Total persisted like rows across every subject.
    pub fn like_row_count(&self) -> usize {
        self.tables.read().likes.len()
    }
}

#[async_trait]
impl SubjectStore for MemorySubjectStore {
    async fn find_subject(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<Option<Subject>> {
        Ok(self.tables.read().subjects.get(&(kind, id)).cloned())
    }

    async fn exists(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        Ok(self.tables.read().subjects.contains_key(&(kind, id)))
    }

    async fn save(&self, subject: &Subject) -> StoreResult<()> {
        self.tables
            .write()
            .subjects
            .insert((subject.kind, subject.id), subject.clone());
        Ok(())
    }

    async fn set_like_count(&self, kind: SubjectKind, id: SubjectId, like_count: u64) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        match tables.subjects.get_mut(&(kind, id)) {
            Some(subject) => {
                subject.like_count = like_count;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_view_count(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        match tables.subjects.get_mut(&(kind, id)) {
            Some(subject) => {
                subject.view_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        tables.likes.retain(|(k, s, _)| !(*k == kind && *s == id));
        Ok(tables.subjects.remove(&(kind, id)).is_some())
    }

    async fn top_by_view_count(&self, kind: SubjectKind, limit: usize) -> StoreResult<Vec<Subject>> {
        let tables = self.tables.read();
        let mut rows: Vec<Subject> = tables
            .subjects
            .values()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.view_count.cmp(&a.view_count).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn like_exists(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<bool> {
        Ok(self.tables.read().likes.contains(&(kind, subject, actor)))
    }

    async fn insert_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        if tables.subjects.contains_key(&(kind, subject)) {
            tables.likes.insert((kind, subject, actor));
        }
        Ok(())
    }

    async fn delete_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
        self.tables.write().likes.remove(&(kind, subject, actor));
        Ok(())
    }

    async fn liked_actor_ids(&self, kind: SubjectKind, subject: SubjectId) -> StoreResult<Vec<ActorId>> {
        let tables = self.tables.read();
        Ok(tables
            .likes
            .range((kind, subject, ActorId(i64::MIN))..=(kind, subject, ActorId(i64::MAX)))
            .map(|(_, _, actor)| *actor)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curation(id: i64, views: u64) -> Subject {
        Subject::new(SubjectKind::Curation, SubjectId(id), format!("curation {id}")).with_counts(0, views)
    }

    #[tokio::test]
    async fn test_top_by_view_count_breaks_ties_by_id() {
        let store = MemorySubjectStore::with_subjects([
            curation(3, 10),
            curation(1, 10),
            curation(2, 50),
            curation(4, 1),
        ]);
        let top = store.top_by_view_count(SubjectKind::Curation, 3).await.unwrap();
        let ids: Vec<i64> = top.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_insert_like_is_idempotent() {
        let store = MemorySubjectStore::with_subjects([curation(42, 0)]);
        let (kind, id) = (SubjectKind::Curation, SubjectId(42));
        store.insert_like(kind, id, ActorId(7)).await.unwrap();
        store.insert_like(kind, id, ActorId(7)).await.unwrap();
        assert_eq!(store.like_row_count(), 1);
        assert_eq!(store.liked_actor_ids(kind, id).await.unwrap(), vec![ActorId(7)]);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_likes_and_reports_missing_rows() {
        let store = MemorySubjectStore::with_subjects([curation(1, 0), curation(2, 0)]);
        let kind = SubjectKind::Curation;
        store.insert_like(kind, SubjectId(1), ActorId(7)).await.unwrap();
        store.insert_like(kind, SubjectId(2), ActorId(7)).await.unwrap();

        assert!(store.delete(kind, SubjectId(1)).await.unwrap());
        assert!(!store.delete(kind, SubjectId(1)).await.unwrap());
        assert_eq!(store.like_row_count(), 1);
        assert!(!store.set_like_count(kind, SubjectId(1), 3).await.unwrap());
        assert!(!store.increment_view_count(kind, SubjectId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_like_for_a_missing_subject_leaves_no_row() {
        let store = MemorySubjectStore::new();
        store.insert_like(SubjectKind::Playlist, SubjectId(8), ActorId(7)).await.unwrap();
        assert_eq!(store.like_row_count(), 0);
    }
}
