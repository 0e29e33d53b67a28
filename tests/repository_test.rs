//! Repository tests against a real SQLite database.

mod common;

use common::{count_rows, run_sql, sqlite_pool};
use dbcore::db::TransactionState;
use dbcore::driver::SqliteConnector;
use dbcore::{
    DbError, EntityMapping, ErrorKind, Pool, PoolOptions, Repository, Statements, params,
};
use futures_util::{StreamExt, TryStreamExt};

#[derive(Debug, Clone, PartialEq)]
struct User {
    email: String,
    name: String,
    age: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct Note {
    id: Option<i64>,
    body: String,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE users (email TEXT PRIMARY KEY, name TEXT NOT NULL, age INTEGER NOT NULL)",
    "CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL)",
];

fn user(email: &str, name: &str, age: i64) -> User {
    User {
        email: email.to_string(),
        name: name.to_string(),
        age,
    }
}

fn user_mapping() -> EntityMapping<User, String> {
    EntityMapping::natural(
        "User",
        Statements {
            insert: "INSERT INTO users (email, name, age) VALUES (?, ?, ?)".into(),
            find_by_id: "SELECT email, name, age FROM users WHERE email = ?".into(),
            find_all: "SELECT email, name, age FROM users ORDER BY email".into(),
            update: "UPDATE users SET name = ?, age = ? WHERE email = ?".into(),
            delete: "DELETE FROM users WHERE email = ?".into(),
        },
        |u: &User| u.email.clone(),
        |row| {
            Ok(User {
                email: row.get("email")?,
                name: row.get("name")?,
                age: row.get("age")?,
            })
        },
    )
    .insert_params(|u| params![u.email.as_str(), u.name.as_str(), u.age])
    .update_params(|u| params![u.name.as_str(), u.age, u.email.as_str()])
}

fn note_mapping() -> EntityMapping<Note, i64> {
    EntityMapping::generated(
        "Note",
        Statements {
            insert: "INSERT INTO notes (body) VALUES (?)".into(),
            find_by_id: "SELECT id, body FROM notes WHERE id = ?".into(),
            find_all: "SELECT id, body FROM notes ORDER BY id".into(),
            update: "UPDATE notes SET body = ? WHERE id = ?".into(),
            delete: "DELETE FROM notes WHERE id = ?".into(),
        },
        |n: &Note| n.id,
        |n: &mut Note, id| n.id = Some(id),
        |row| {
            Ok(Note {
                id: row.get("id")?,
                body: row.get("body")?,
            })
        },
    )
    .insert_params(|n| params![n.body.as_str()])
    .update_params(|n| params![n.body.as_str(), n.id])
}

/// Like `user_mapping`, but refuses to decode rows with a negative age.
fn checked_user_mapping() -> EntityMapping<User, String> {
    EntityMapping::natural(
        "User",
        user_mapping().statements().clone(),
        |u: &User| u.email.clone(),
        |row| {
            let age: i64 = row.get("age")?;
            if age < 0 {
                return Err(DbError::schema(format!("negative age {}", age)));
            }
            Ok(User {
                email: row.get("email")?,
                name: row.get("name")?,
                age,
            })
        },
    )
    .insert_params(|u| params![u.email.as_str(), u.name.as_str(), u.age])
    .update_params(|u| params![u.name.as_str(), u.age, u.email.as_str()])
}

async fn setup() -> (tempfile::TempDir, Pool<SqliteConnector>) {
    let (dir, pool) = sqlite_pool(PoolOptions::new().max_connections(3)).await;
    run_sql(&pool, SCHEMA).await;
    (dir, pool)
}

#[tokio::test]
async fn test_create_then_find_round_trip() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool, user_mapping());

    let mut ada = user("ada@example.com", "Ada", 36);
    let id = users.create(&mut ada).await.unwrap();
    assert_eq!(id, "ada@example.com");

    let found = users.find_by_id(&id).await.unwrap();
    assert_eq!(found, Some(ada));
}

#[tokio::test]
async fn test_find_missing_returns_none() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool, user_mapping());

    let found = users
        .find_by_id(&"nobody@example.com".to_string())
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_duplicate_natural_key_is_constraint_violation() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), user_mapping());

    users
        .create(&mut user("grace@example.com", "Grace", 45))
        .await
        .unwrap();
    let err = users
        .create(&mut user("grace@example.com", "Other Grace", 30))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert!(!err.is_retryable());
    assert_eq!(count_rows(&pool, "users").await, 1);
}

#[tokio::test]
async fn test_update_existing_and_missing() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool, user_mapping());

    let mut linus = user("linus@example.com", "Linus", 28);
    users.create(&mut linus).await.unwrap();

    linus.age = 29;
    linus.name = "Linus T.".into();
    users.update(&linus).await.unwrap();
    let found = users.find_by_id(&linus.email).await.unwrap().unwrap();
    assert_eq!(found, linus);

    let ghost = user("ghost@example.com", "Ghost", 1);
    let err = users.update(&ghost).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("ghost@example.com"));
}

#[tokio::test]
async fn test_delete_twice() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool, user_mapping());

    let mut alan = user("alan@example.com", "Alan", 41);
    users.create(&mut alan).await.unwrap();

    assert!(users.delete(&alan.email).await.unwrap());
    assert!(!users.delete(&alan.email).await.unwrap());
    assert!(users.find_by_id(&alan.email).await.unwrap().is_none());
}

#[tokio::test]
async fn test_generated_key_written_back() {
    let (_dir, pool) = setup().await;
    let notes = Repository::new(pool, note_mapping());

    let mut first = Note {
        id: None,
        body: "first".into(),
    };
    let mut second = Note {
        id: None,
        body: "second".into(),
    };
    let first_id = notes.create(&mut first).await.unwrap();
    let second_id = notes.create(&mut second).await.unwrap();

    assert_eq!(first.id, Some(first_id));
    assert_eq!(second.id, Some(second_id));
    assert!(second_id > first_id);

    second.body = "second, edited".into();
    notes.update(&second).await.unwrap();
    let found = notes.find_by_id(&second_id).await.unwrap().unwrap();
    assert_eq!(found.body, "second, edited");
}

#[tokio::test]
async fn test_find_all_streams_every_entity() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), user_mapping());

    for (email, name, age) in [
        ("c@example.com", "C", 3),
        ("a@example.com", "A", 1),
        ("b@example.com", "B", 2),
    ] {
        users.create(&mut user(email, name, age)).await.unwrap();
    }

    let all: Vec<User> = users.find_all().try_collect().await.unwrap();
    let emails: Vec<&str> = all.iter().map(|u| u.email.as_str()).collect();
    assert_eq!(emails, ["a@example.com", "b@example.com", "c@example.com"]);

    // Taking one element and dropping the stream hands the connection back.
    let first = users.find_all().next().await.unwrap().unwrap();
    assert_eq!(first.email, "a@example.com");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_operations_compose_in_one_transaction() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), user_mapping());
    let notes = Repository::new(pool.clone(), note_mapping());

    let tx_users = users.clone();
    let tx_notes = notes.clone();
    let err = pool
        .with_transaction(move |tx| {
            Box::pin(async move {
                tx_users
                    .create_in(tx, &mut user("edsger@example.com", "Edsger", 72))
                    .await?;
                let mut note = Note {
                    id: None,
                    body: "goto considered harmful".into(),
                };
                tx_notes.create_in(tx, &mut note).await?;

                // Both writes are visible inside the transaction.
                let seen: Vec<User> = tx_users.find_all_in(tx).await?.try_collect().await?;
                assert_eq!(seen.len(), 1);
                assert!(tx_notes.find_by_id_in(tx, &note.id.unwrap_or_default()).await?.is_some());

                Err::<(), DbError>(DbError::schema("abort after both writes"))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SyntaxOrSchema);
    assert_eq!(count_rows(&pool, "users").await, 0);
    assert_eq!(count_rows(&pool, "notes").await, 0);
}

#[tokio::test]
async fn test_transactional_update_and_delete() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), user_mapping());

    let mut barbara = user("barbara@example.com", "Barbara", 50);
    let mut ken = user("ken@example.com", "Ken", 60);
    users.create(&mut barbara).await.unwrap();
    users.create(&mut ken).await.unwrap();

    let mut conn = pool.acquire_default().await.unwrap();
    let mut tx = conn.begin().await.unwrap();
    barbara.age = 51;
    users.update_in(&mut tx, &barbara).await.unwrap();
    assert!(users.delete_in(&mut tx, &ken.email).await.unwrap());
    tx.commit().await.unwrap();
    drop(tx);
    conn.release().await;

    let all: Vec<User> = users.find_all().try_collect().await.unwrap();
    assert_eq!(all, vec![barbara]);
}

#[tokio::test]
async fn test_update_missing_inside_transaction_rolls_back() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), user_mapping());

    let mut conn = pool.acquire_default().await.unwrap();
    {
        let mut tx = conn.begin().await.unwrap();
        users
            .create_in(&mut tx, &mut user("ada@example.com", "Ada", 36))
            .await
            .unwrap();

        let err = users
            .update_in(&mut tx, &user("ghost@example.com", "Ghost", 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(tx.state(), TransactionState::RolledBack);

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionAlreadyClosed);
    }
    conn.release().await;

    assert_eq!(count_rows(&pool, "users").await, 0);
}

#[tokio::test]
async fn test_decode_failure_inside_transaction_rolls_back() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), checked_user_mapping());

    let mut conn = pool.acquire_default().await.unwrap();
    {
        let mut tx = conn.begin().await.unwrap();
        users
            .create_in(&mut tx, &mut user("old@example.com", "Old", -1))
            .await
            .unwrap();

        let err = users
            .find_by_id_in(&mut tx, &"old@example.com".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyntaxOrSchema);
        assert!(err.to_string().contains("negative age"));
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }
    // Decode failures are not store failures; the session stays usable.
    assert!(!conn.is_broken());
    conn.release().await;

    assert_eq!(count_rows(&pool, "users").await, 0);
}

#[tokio::test]
async fn test_streamed_decode_failure_ends_stream_and_rolls_back() {
    let (_dir, pool) = setup().await;
    let users = Repository::new(pool.clone(), checked_user_mapping());

    let mut conn = pool.acquire_default().await.unwrap();
    {
        let mut tx = conn.begin().await.unwrap();
        for (email, age) in [("a@example.com", 1), ("b@example.com", -1), ("c@example.com", 3)] {
            users
                .create_in(&mut tx, &mut user(email, "X", age))
                .await
                .unwrap();
        }

        let results: Vec<_> = users.find_all_in(&mut tx).await.unwrap().collect().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().email, "a@example.com");
        assert_eq!(
            results[1].as_ref().unwrap_err().kind(),
            ErrorKind::SyntaxOrSchema
        );
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }
    conn.release().await;

    assert_eq!(count_rows(&pool, "users").await, 0);
}
