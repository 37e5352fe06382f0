use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::Result;
use chatter_types::models::ActiveSession;
use rusqlite::Connection;
use uuid::Uuid;

/// Outcome of the signup check-then-insert unit.
pub enum SignupOutcome {
    Created(UserRow),
    /// Name or email already taken; carries the committed row.
    Exists(UserRow),
}

/// Result of the disconnect cleanup unit. `None` from the query means the
/// connection had no session (duplicate disconnect) and nothing was touched.
pub struct DisconnectCleanup {
    pub user_name: String,
    /// Distinct online names, read back in the same critical section.
    pub online: Vec<String>,
}

impl Database {
    // -- Users --

    /// Signup: existence check on name OR email, then insert, one critical
    /// section. Two concurrent signups with the same identity cannot both
    /// pass the check — the mutex in `with_conn` serializes them.
    pub fn create_user_unique(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
        avatar_url: &str,
        last_login: i64,
    ) -> Result<SignupOutcome> {
        self.with_conn(|conn| {
            if let Some(existing) = query_user_by_name_or_email(conn, name, email)? {
                return Ok(SignupOutcome::Exists(existing));
            }

            conn.execute(
                "INSERT INTO users (name, email, password, room, avatar_url, last_login)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                rusqlite::params![name, email, password_hash, avatar_url, last_login],
            )?;
            let id = conn.last_insert_rowid();

            Ok(SignupOutcome::Created(UserRow {
                id,
                name: name.to_string(),
                email: email.to_string(),
                password: password_hash.to_string(),
                room: None,
                avatar_url: avatar_url.to_string(),
                last_login,
            }))
        })
    }

    /// Login lookup: `identifier` matches name OR email.
    pub fn get_user_by_identifier(&self, identifier: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user_by_name_or_email(conn, identifier, identifier)
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_USER))?;
            stmt.query_row([id], user_from_row).optional()
        })
    }

    pub fn get_user_by_name(&self, name: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE name = ?1", SELECT_USER))?;
            stmt.query_row([name], user_from_row).optional()
        })
    }

    /// Login success: room and last_login move in one combined update.
    /// Returns the refreshed row.
    pub fn login_user(&self, id: i64, room: &str, last_login: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET room = ?1, last_login = ?2 WHERE id = ?3",
                rusqlite::params![room, last_login, id],
            )?;
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_USER))?;
            stmt.query_row([id], user_from_row).optional()
        })
    }

    /// Room change: pure field update, echoes the refreshed row.
    pub fn update_room(&self, id: i64, new_room: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET room = ?1 WHERE id = ?2",
                rusqlite::params![new_room, id],
            )?;
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_USER))?;
            stmt.query_row([id], user_from_row).optional()
        })
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_USER))?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Insert a message and hand back the fully-materialized row with its
    /// store-assigned id.
    pub fn insert_message(
        &self,
        author_id: i64,
        content: &str,
        kind: &str,
        recipient: Option<&str>,
        room: Option<&str>,
        created_at: i64,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (author_id, content, kind, recipient, created_at, room)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![author_id, content, kind, recipient, created_at, room],
            )?;
            let id = conn.last_insert_rowid();

            Ok(MessageRow {
                id,
                author_id,
                content: content.to_string(),
                kind: kind.to_string(),
                recipient: recipient.map(str::to_string),
                created_at,
                room: room.map(str::to_string),
            })
        })
    }

    /// Idempotent delete-by-id. Deleting an absent row is success, not an
    /// error, so racing deleters converge.
    pub fn delete_message(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Full snapshot, ordered by (created_at, id) ascending. The id is the
    /// tie-break for equal timestamps.
    pub fn list_messages(&self) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author_id, content, kind, recipient, created_at, room
                 FROM messages
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        content: row.get(2)?,
                        kind: row.get(3)?,
                        recipient: row.get(4)?,
                        created_at: row.get(5)?,
                        room: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Sessions --

    /// Register presence for a connection and read back the distinct online
    /// list in the same critical section, so the broadcast reflects this
    /// mutation and not a stale concurrent read.
    pub fn add_session(&self, session: &ActiveSession) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (connection_id, user_name) VALUES (?1, ?2)",
                rusqlite::params![session.connection_id.to_string(), session.user_name],
            )?;
            distinct_online(conn)
        })
    }

    /// Explicit logout: drop every session row held by `user_name`, across
    /// all tabs, then read back the distinct list.
    pub fn remove_sessions_for_user(&self, user_name: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE user_name = ?1", [user_name])?;
            distinct_online(conn)
        })
    }

    /// The disconnect unit: look up the session for this connection, delete
    /// it, clear the user's room unless another session for the same user is
    /// still live, and read back the distinct list — all under one lock hold.
    /// A connection with no session (duplicate disconnect) is a no-op.
    pub fn cleanup_connection(&self, connection_id: Uuid) -> Result<Option<DisconnectCleanup>> {
        self.with_conn(|conn| {
            let cid = connection_id.to_string();
            let user_name: Option<String> = conn
                .query_row(
                    "SELECT user_name FROM sessions WHERE connection_id = ?1",
                    [&cid],
                    |row| row.get(0),
                )
                .optional()?;

            let user_name = match user_name {
                Some(name) => name,
                None => return Ok(None),
            };

            conn.execute("DELETE FROM sessions WHERE connection_id = ?1", [&cid])?;

            let remaining: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE user_name = ?1",
                [&user_name],
                |row| row.get(0),
            )?;

            // A surviving session for the same user keeps ownership of the
            // room field; clearing it here would lose a fresh login's room.
            if remaining == 0 {
                conn.execute(
                    "UPDATE users SET room = NULL WHERE name = ?1",
                    [&user_name],
                )?;
            }

            let online = distinct_online(conn)?;
            Ok(Some(DisconnectCleanup { user_name, online }))
        })
    }

    /// Distinct names of users with at least one live session.
    pub fn online_user_names(&self) -> Result<Vec<String>> {
        self.with_conn(distinct_online)
    }
}

const SELECT_USER: &str =
    "SELECT id, name, email, password, room, avatar_url, last_login FROM users";

fn user_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        room: row.get(4)?,
        avatar_url: row.get(5)?,
        last_login: row.get(6)?,
    })
}

fn query_user_by_name_or_email(
    conn: &Connection,
    name: &str,
    email: &str,
) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!("{} WHERE name = ?1 OR email = ?2", SELECT_USER))?;
    stmt.query_row(rusqlite::params![name, email], user_from_row)
        .optional()
}

fn distinct_online(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT user_name FROM sessions ORDER BY user_name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn session(name: &str, connection_id: Uuid) -> ActiveSession {
        ActiveSession {
            user_name: name.to_string(),
            connection_id,
        }
    }

    fn signup(db: &Database, name: &str, email: &str) -> UserRow {
        match db
            .create_user_unique(name, email, "hash", "http://avatar/x", 1_000)
            .unwrap()
        {
            SignupOutcome::Created(row) => row,
            SignupOutcome::Exists(_) => panic!("signup for {} unexpectedly conflicted", name),
        }
    }

    #[test]
    fn test_signup_assigns_monotonic_ids() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");
        let bob = signup(&db, "bob", "b@x.com");
        assert_eq!(alice.id, 1);
        assert_eq!(bob.id, 2);
    }

    #[test]
    fn test_signup_conflict_returns_committed_row() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");

        // Same name, different email
        match db
            .create_user_unique("alice", "b@y.com", "hash2", "http://avatar/y", 2_000)
            .unwrap()
        {
            SignupOutcome::Exists(existing) => {
                assert_eq!(existing.id, alice.id);
                assert_eq!(existing.email, "a@x.com");
            }
            SignupOutcome::Created(_) => panic!("duplicate name accepted"),
        }

        // Different name, same email
        match db
            .create_user_unique("alicia", "a@x.com", "hash3", "http://avatar/z", 3_000)
            .unwrap()
        {
            SignupOutcome::Exists(existing) => assert_eq!(existing.id, alice.id),
            SignupOutcome::Created(_) => panic!("duplicate email accepted"),
        }

        // Exactly one user committed
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_duplicate_signups_single_winner() {
        use std::sync::{Arc, Barrier};

        let db = Arc::new(db());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    db.create_user_unique(
                        &format!("user{}", i),
                        "same@x.com",
                        "hash",
                        "http://avatar/x",
                        1_000,
                    )
                    .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<SignupOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // The existence check and the insert share one critical section, so
        // exactly one signup commits and the loser sees the committed row.
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, SignupOutcome::Created(_)))
            .count();
        assert_eq!(winners, 1);
        for outcome in &outcomes {
            if let SignupOutcome::Exists(existing) = outcome {
                assert_eq!(existing.email, "same@x.com");
            }
        }
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_login_updates_room_and_last_login_together() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");
        assert!(alice.room.is_none());

        let refreshed = db.login_user(alice.id, "roomA", 5_000).unwrap().unwrap();
        assert_eq!(refreshed.room.as_deref(), Some("roomA"));
        assert_eq!(refreshed.last_login, 5_000);
    }

    #[test]
    fn test_identifier_matches_name_or_email() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");
        assert_eq!(db.get_user_by_identifier("alice").unwrap().unwrap().id, alice.id);
        assert_eq!(db.get_user_by_identifier("a@x.com").unwrap().unwrap().id, alice.id);
        assert!(db.get_user_by_identifier("nobody").unwrap().is_none());
    }

    #[test]
    fn test_messages_ordered_by_created_at_then_id() {
        let db = db();
        signup(&db, "alice", "a@x.com");

        // Insert out of timestamp order; ids 1..=4 in insertion order
        db.insert_message(1, "late", "chat", None, None, 300).unwrap();
        db.insert_message(1, "tie-first", "chat", None, None, 100).unwrap();
        db.insert_message(1, "tie-second", "chat", None, None, 100).unwrap();
        db.insert_message(1, "middle", "chat", None, None, 200).unwrap();

        let contents: Vec<String> = db
            .list_messages()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        // Equal timestamps fall back to insertion id
        assert_eq!(contents, vec!["tie-first", "tie-second", "middle", "late"]);
    }

    #[test]
    fn test_delete_message_is_idempotent() {
        let db = db();
        signup(&db, "alice", "a@x.com");
        let msg = db.insert_message(1, "hi", "chat", None, None, 100).unwrap();

        db.delete_message(msg.id).unwrap();
        assert!(db.list_messages().unwrap().is_empty());

        // Second delete of the same id, and a delete of a never-existing id,
        // both succeed silently.
        db.delete_message(msg.id).unwrap();
        db.delete_message(9999).unwrap();
    }

    #[test]
    fn test_online_list_deduplicates_multi_tab() {
        let db = db();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();

        assert_eq!(db.add_session(&session("alice", c1)).unwrap(), vec!["alice"]);
        // Second tab for alice collapses to one entry
        assert_eq!(db.add_session(&session("alice", c2)).unwrap(), vec!["alice"]);
        assert_eq!(db.add_session(&session("bob", c3)).unwrap(), vec!["alice", "bob"]);

        // Explicit logout removes every one of alice's sessions
        assert_eq!(db.remove_sessions_for_user("alice").unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_disconnect_cleanup_clears_room_and_session() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");
        db.login_user(alice.id, "roomA", 5_000).unwrap();

        let conn_id = Uuid::new_v4();
        db.add_session(&session("alice", conn_id)).unwrap();

        let cleanup = db.cleanup_connection(conn_id).unwrap().unwrap();
        assert_eq!(cleanup.user_name, "alice");
        assert!(cleanup.online.is_empty());

        // Session row gone, room cleared
        assert!(db.online_user_names().unwrap().is_empty());
        let row = db.get_user_by_id(alice.id).unwrap().unwrap();
        assert!(row.room.is_none());
    }

    #[test]
    fn test_disconnect_keeps_room_while_another_session_lives() {
        let db = db();
        let alice = signup(&db, "alice", "a@x.com");

        let old_tab = Uuid::new_v4();
        let new_tab = Uuid::new_v4();
        db.add_session(&session("alice", old_tab)).unwrap();
        db.add_session(&session("alice", new_tab)).unwrap();

        // Fresh login on the new tab sets a room
        db.login_user(alice.id, "roomB", 6_000).unwrap();

        // The old tab disconnecting must not wipe the new tab's room
        let cleanup = db.cleanup_connection(old_tab).unwrap().unwrap();
        assert_eq!(cleanup.online, vec!["alice"]);
        let row = db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(row.room.as_deref(), Some("roomB"));

        // Last session going away clears it
        db.cleanup_connection(new_tab).unwrap().unwrap();
        let row = db.get_user_by_id(alice.id).unwrap().unwrap();
        assert!(row.room.is_none());
    }

    #[test]
    fn test_duplicate_disconnect_is_a_noop() {
        let db = db();
        let conn_id = Uuid::new_v4();
        db.add_session(&session("alice", conn_id)).unwrap();

        assert!(db.cleanup_connection(conn_id).unwrap().is_some());
        assert!(db.cleanup_connection(conn_id).unwrap().is_none());
        assert!(db.cleanup_connection(Uuid::new_v4()).unwrap().is_none());
    }
}
