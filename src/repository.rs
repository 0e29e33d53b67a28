//! Generic repository over injected entity mappings.
//!
//! A [`Repository`] provides create/read/update/delete for one entity type
//! `T` identified by `ID`. It knows nothing about `T` beyond the
//! [`EntityMapping`] supplied at construction: the SQL templates, functions
//! that turn an entity into positional parameters, a row decoder and how the
//! key is assigned.
//!
//! Each operation acquires its own pooled connection. The `*_in` variants
//! run on a caller-supplied connection or transaction instead, so several
//! operations can be composed atomically.

use crate::db::executor::StatementExecutor;
use crate::db::pool::{AsConnection, Pool};
use crate::db::value::{FromSqlValue, Row, SqlValue};
use crate::driver::Connector;
use crate::error::{DbError, DbResult};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// SQL templates for the five repository operations, with positional
/// placeholders.
///
/// - `insert` binds the insert parameters
/// - `find_by_id` and `delete` bind the id
/// - `find_all` binds nothing
/// - `update` binds the update parameters, which end with the id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statements {
    pub insert: String,
    pub find_by_id: String,
    pub find_all: String,
    pub update: String,
    pub delete: String,
}

/// Where an entity's identifier comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Assigned by the caller before insert
    Natural,
    /// Generated by the store on insert and written back to the entity
    Generated,
}

type ParamsFn<T> = Box<dyn Fn(&T) -> Vec<SqlValue> + Send + Sync>;
type IdFn<T, ID> = Box<dyn Fn(&T) -> Option<ID> + Send + Sync>;
type AssignFn<T, ID> = Box<dyn Fn(&mut T, ID) + Send + Sync>;
type RowFn<T> = Box<dyn Fn(&Row) -> DbResult<T> + Send + Sync>;

/// How one entity type maps onto the store.
pub struct EntityMapping<T, ID> {
    entity: String,
    statements: Statements,
    key: KeyStrategy,
    id_of: IdFn<T, ID>,
    assign_id: AssignFn<T, ID>,
    insert_params: ParamsFn<T>,
    update_params: ParamsFn<T>,
    from_row: RowFn<T>,
}

impl<T, ID> fmt::Debug for EntityMapping<T, ID> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMapping")
            .field("entity", &self.entity)
            .field("statements", &self.statements)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: 'static, ID: 'static> EntityMapping<T, ID> {
    /// Mapping for an entity whose key is assigned by the caller.
    pub fn natural(
        entity: impl Into<String>,
        statements: Statements,
        id_of: impl Fn(&T) -> ID + Send + Sync + 'static,
        from_row: impl Fn(&Row) -> DbResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity: entity.into(),
            statements,
            key: KeyStrategy::Natural,
            id_of: Box::new(move |entity: &T| Some(id_of(entity))),
            assign_id: Box::new(|_: &mut T, _: ID| {}),
            insert_params: Box::new(|_: &T| Vec::new()),
            update_params: Box::new(|_: &T| Vec::new()),
            from_row: Box::new(from_row),
        }
    }

    /// Mapping for an entity whose key is generated by the store. `id_of`
    /// returns `None` until the entity has been inserted.
    pub fn generated(
        entity: impl Into<String>,
        statements: Statements,
        id_of: impl Fn(&T) -> Option<ID> + Send + Sync + 'static,
        assign_id: impl Fn(&mut T, ID) + Send + Sync + 'static,
        from_row: impl Fn(&Row) -> DbResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            entity: entity.into(),
            statements,
            key: KeyStrategy::Generated,
            id_of: Box::new(id_of),
            assign_id: Box::new(assign_id),
            insert_params: Box::new(|_: &T| Vec::new()),
            update_params: Box::new(|_: &T| Vec::new()),
            from_row: Box::new(from_row),
        }
    }

    /// Parameters bound to the insert statement.
    pub fn insert_params(
        mut self,
        f: impl Fn(&T) -> Vec<SqlValue> + Send + Sync + 'static,
    ) -> Self {
        self.insert_params = Box::new(f);
        self
    }

    /// Parameters bound to the update statement; the id comes last.
    pub fn update_params(
        mut self,
        f: impl Fn(&T) -> Vec<SqlValue> + Send + Sync + 'static,
    ) -> Self {
        self.update_params = Box::new(f);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn statements(&self) -> &Statements {
        &self.statements
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        self.key
    }
}

impl<T, ID: Into<SqlValue>> EntityMapping<T, ID> {
    fn describe_id(&self, entity: &T) -> String {
        match (self.id_of)(entity) {
            Some(id) => {
                let value: SqlValue = id.into();
                value.to_string()
            }
            None => "<unassigned>".to_string(),
        }
    }
}

/// CRUD operations for entity `T` keyed by `ID`.
pub struct Repository<K: Connector, T, ID> {
    pool: Pool<K>,
    executor: StatementExecutor,
    mapping: Arc<EntityMapping<T, ID>>,
}

impl<K: Connector, T, ID> Clone for Repository<K, T, ID> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            mapping: Arc::clone(&self.mapping),
        }
    }
}

impl<K: Connector, T, ID> fmt::Debug for Repository<K, T, ID> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &self.mapping.entity)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<K, T, ID> Repository<K, T, ID>
where
    K: Connector,
    T: Send + Sync + 'static,
    ID: Into<SqlValue> + FromSqlValue + Clone + Send + Sync + 'static,
{
    /// Create a repository. Statements use the pool's statement timeout.
    pub fn new(pool: Pool<K>, mapping: EntityMapping<T, ID>) -> Self {
        let executor = StatementExecutor::from_options(pool.options());
        Self {
            pool,
            executor,
            mapping: Arc::new(mapping),
        }
    }

    pub fn with_executor(mut self, executor: StatementExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn pool(&self) -> &Pool<K> {
        &self.pool
    }

    pub fn mapping(&self) -> &EntityMapping<T, ID> {
        &self.mapping
    }

    /// Insert `entity` and return its id. A generated id is written back
    /// into the entity.
    pub async fn create(&self, entity: &mut T) -> DbResult<ID> {
        let mut conn = self.pool.acquire_default().await?;
        let result = self.create_in(&mut conn, entity).await;
        conn.release().await;
        result
    }

    pub async fn create_in(
        &self,
        scope: &mut impl AsConnection<K>,
        entity: &mut T,
    ) -> DbResult<ID> {
        let mapping = &self.mapping;
        let params = (mapping.insert_params)(entity);
        let outcome = self
            .executor
            .execute_outcome(scope, &mapping.statements.insert, &params)
            .await?;

        let id = match mapping.key {
            KeyStrategy::Natural => (mapping.id_of)(entity).ok_or_else(|| {
                DbError::schema(format!("{} has no natural key", mapping.entity))
            }),
            KeyStrategy::Generated => outcome
                .last_insert_id
                .ok_or_else(|| {
                    DbError::schema(format!(
                        "driver reported no generated key for {}",
                        mapping.entity
                    ))
                })
                .and_then(|generated| ID::from_sql_value(&SqlValue::Int(generated)))
                .map(|id| {
                    (mapping.assign_id)(entity, id.clone());
                    id
                }),
        };
        let id = match id {
            Ok(id) => id,
            Err(e) => return Err(scope.as_connection().reject(e).await),
        };

        debug!(entity = %mapping.entity, id = %mapping.describe_id(entity), "Entity created");
        Ok(id)
    }

    /// Look up one entity. A miss is `Ok(None)`.
    pub async fn find_by_id(&self, id: &ID) -> DbResult<Option<T>> {
        let mut conn = self.pool.acquire_default().await?;
        let result = self.find_by_id_in(&mut conn, id).await;
        conn.release().await;
        result
    }

    pub async fn find_by_id_in(
        &self,
        scope: &mut impl AsConnection<K>,
        id: &ID,
    ) -> DbResult<Option<T>> {
        let row = self
            .executor
            .query_one(
                scope,
                &self.mapping.statements.find_by_id,
                vec![id.clone().into()],
            )
            .await?;
        match row.map(|row| (self.mapping.from_row)(&row)).transpose() {
            Ok(found) => Ok(found),
            Err(e) => Err(scope.as_connection().reject(e).await),
        }
    }

    /// Stream every entity. The stream holds its own connection until it is
    /// exhausted or dropped.
    pub fn find_all(&self) -> BoxStream<'static, DbResult<T>> {
        let pool = self.pool.clone();
        let executor = self.executor.clone();
        let mapping = Arc::clone(&self.mapping);

        async_stream::stream! {
            let mut conn = match pool.acquire_default().await {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let decode_with = Arc::clone(&mapping);
            match executor
                .query_as(&mut conn, &mapping.statements.find_all, Vec::new(), move |row| {
                    (decode_with.from_row)(&row)
                })
                .await
            {
                Ok(mut entities) => {
                    while let Some(entity) = entities.next().await {
                        yield entity;
                    }
                }
                Err(e) => yield Err(e),
            }

            conn.release().await;
        }
        .boxed()
    }

    /// Stream every entity using the caller's connection or transaction.
    pub async fn find_all_in<'c, S>(
        &'c self,
        scope: &'c mut S,
    ) -> DbResult<BoxStream<'c, DbResult<T>>>
    where
        S: AsConnection<K>,
    {
        let mapping = &self.mapping;
        self.executor
            .query_as(scope, &mapping.statements.find_all, Vec::new(), move |row| {
                (mapping.from_row)(&row)
            })
            .await
    }

    /// Replace the stored row for `entity`. Fails with `NotFound` when no
    /// row has its id.
    pub async fn update(&self, entity: &T) -> DbResult<()> {
        let mut conn = self.pool.acquire_default().await?;
        let result = self.update_in(&mut conn, entity).await;
        conn.release().await;
        result
    }

    pub async fn update_in(&self, scope: &mut impl AsConnection<K>, entity: &T) -> DbResult<()> {
        let mapping = &self.mapping;
        let params = (mapping.update_params)(entity);
        let affected = self
            .executor
            .execute(scope, &mapping.statements.update, &params)
            .await?;
        if affected == 0 {
            let error = DbError::not_found(mapping.entity.clone(), mapping.describe_id(entity));
            return Err(scope.as_connection().reject(error).await);
        }
        debug!(entity = %mapping.entity, id = %mapping.describe_id(entity), "Entity updated");
        Ok(())
    }

    /// Delete by id. Returns whether a row was removed; deleting a missing
    /// id is not an error.
    pub async fn delete(&self, id: &ID) -> DbResult<bool> {
        let mut conn = self.pool.acquire_default().await?;
        let result = self.delete_in(&mut conn, id).await;
        conn.release().await;
        result
    }

    pub async fn delete_in(&self, scope: &mut impl AsConnection<K>, id: &ID) -> DbResult<bool> {
        let affected = self
            .executor
            .execute(scope, &self.mapping.statements.delete, &[id.clone().into()])
            .await?;
        Ok(affected > 0)
    }
}
