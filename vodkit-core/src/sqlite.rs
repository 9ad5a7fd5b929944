use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};

/// Pragmas shared by every store: WAL so readers never block the writer, and a
/// busy timeout so concurrent workers wait on the write lock instead of failing.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// Location and open mode of an SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteTarget {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteTarget {
    pub fn new(path: impl AsRef<Path>, read_only: bool, create_if_missing: bool) -> Self {
        let mut flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !read_only && create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        flags |= OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        Self {
            path: path.as_ref().to_path_buf(),
            flags,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> rusqlite::Result<Connection> {
        if self.flags.contains(OpenFlags::SQLITE_OPEN_CREATE) {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags)?;
        if self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
        } else {
            configure_connection(&conn)?;
        }
        Ok(conn)
    }
}
