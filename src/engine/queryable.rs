use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::engine::collection::Collection;
use crate::engine::relations;
use crate::engine::tracker::Tracked;
use crate::query::Query;
use crate::schema::Entity;
use crate::Result;

/// Fluent query over one collection.
///
/// ```ignore
/// let honours = students
///     .queryable()
///     .filter(Query::gt("number", 100))
///     .include("grades")
///     .to_list()
///     .await?;
/// ```
pub struct Queryable<'a, T> {
    collection: &'a Collection<T>,
    query: Option<Query>,
    include: Vec<String>,
}

impl<'a, T: Entity> Queryable<'a, T> {
    pub(crate) fn new(collection: &'a Collection<T>) -> Self {
        Self {
            collection,
            query: None,
            include: Vec::new(),
        }
    }

    /// Narrows the results. Repeated filters must all match.
    pub fn filter(mut self, query: Query) -> Self {
        self.query = Some(match self.query.take() {
            Some(current) => current.and(query),
            None => query,
        });
        self
    }

    /// Loads the named virtual field on every result.
    pub fn include(mut self, field: &str) -> Self {
        self.include.push(field.to_string());
        self
    }

    /// Streams the matching records, loading the included virtual fields of each.
    pub fn stream(self) -> BoxStream<'a, Result<Tracked<T>>> {
        let collection = self.collection;
        for name in &self.include {
            if let Err(e) = relations::virtual_field::<T>(name) {
                return stream::once(async move { Err(e) }).boxed();
            }
        }

        let results = match &self.query {
            Some(query) => collection.find(query),
            None => collection.iterate(),
        };
        if self.include.is_empty() {
            return results;
        }

        let include = Arc::new(self.include);
        results
            .and_then(move |handle| {
                let include = include.clone();
                async move {
                    collection.load_virtual(&handle, include.as_slice()).await?;
                    Ok(handle)
                }
            })
            .boxed()
    }

    /// Collects every match, in file order.
    pub async fn to_list(self) -> Result<Vec<Tracked<T>>> {
        self.stream().try_collect().await
    }

    pub async fn first(self) -> Result<Option<Tracked<T>>> {
        self.stream().try_next().await
    }

    /// Whether any record matches. Nothing is tracked.
    pub async fn any(self) -> Result<bool> {
        match &self.query {
            Some(query) => {
                let filter = query.resolve(T::schema())?;
                Ok(self.collection.slaves_matching(filter).try_next().await?.is_some())
            }
            None => Ok(self.collection.count().await? > 0),
        }
    }

    /// Number of matching records. Nothing is tracked.
    pub async fn count(self) -> Result<usize> {
        match &self.query {
            Some(query) => {
                let filter = query.resolve(T::schema())?;
                self.collection
                    .slaves_matching(filter)
                    .try_fold(0, |count, _| async move { Ok(count + 1) })
                    .await
            }
            None => self.collection.count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::Student;
    use crate::Error;
    use tempfile::tempdir;

    async fn seeded(dir: &std::path::Path) -> Collection<Student> {
        let students = Collection::<Student>::open(dir, "Student");
        students.add_range((1..=6).map(|n| Student::new(n, if n <= 3 { "low" } else { "high" })));
        students.commit().await.unwrap();
        students
    }

    #[tokio::test]
    async fn test_filters_are_combined() {
        let dir = tempdir().unwrap();
        let students = seeded(dir.path()).await;

        let found = students
            .queryable()
            .filter(Query::eq("name", "high"))
            .filter(Query::lt("number", 6))
            .to_list()
            .await
            .unwrap();
        let numbers: Vec<i64> = found.iter().map(|h| h.read().number).collect();
        assert_eq!(numbers, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_count_and_any_do_not_track() {
        let dir = tempdir().unwrap();
        let students = seeded(dir.path()).await;

        assert_eq!(students.queryable().count().await.unwrap(), 6);
        assert_eq!(students.queryable().filter(Query::eq("name", "low")).count().await.unwrap(), 3);
        assert!(students.queryable().filter(Query::gt("number", 5)).any().await.unwrap());
        assert!(!students.queryable().filter(Query::gt("number", 6)).any().await.unwrap());

        // nothing tracked, so nothing to commit
        assert_eq!(students.commit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_without_filter() {
        let dir = tempdir().unwrap();
        let students = seeded(dir.path()).await;
        let first = students.queryable().first().await.unwrap().unwrap();
        assert_eq!(first.read().number, 1);
    }

    #[tokio::test]
    async fn test_include_rejects_inline_fields() {
        let dir = tempdir().unwrap();
        let students = seeded(dir.path()).await;
        let err = students.queryable().include("name").to_list().await.unwrap_err();
        assert!(matches!(err, Error::NotVirtual { .. }));
    }
}
