use log::{debug, warn};
use rusqlite::Connection;

use crate::{Error, Result};

/// Nesting transaction bookkeeping for one connection.
///
/// Only the outermost level issues `BEGIN`/`COMMIT`. The outermost end commits
/// only if every level was marked successful; otherwise it rolls back.
#[derive(Debug, Default)]
pub struct TransactionState {
    levels: Vec<bool>,
    failed: bool,
}

impl TransactionState {
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn begin(&mut self, conn: &Connection) -> Result<()> {
        if self.levels.is_empty() {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            self.failed = false;
        }
        self.levels.push(false);
        Ok(())
    }

    pub fn set_successful(&mut self) -> Result<()> {
        match self.levels.last_mut() {
            Some(level) => {
                *level = true;
                Ok(())
            }
            None => Err(Error::InvalidOperation("no transaction in progress".to_string())),
        }
    }

    /// Ends the innermost level. Returns `true` when this ended the outermost
    /// level with a rollback.
    pub fn end(&mut self, conn: &Connection) -> Result<bool> {
        let successful = self
            .levels
            .pop()
            .ok_or_else(|| Error::InvalidOperation("no transaction in progress".to_string()))?;
        if !successful {
            self.failed = true;
        }
        if !self.levels.is_empty() {
            return Ok(false);
        }

        if self.failed {
            debug!("Rolling back transaction");
            conn.execute_batch("ROLLBACK")?;
            return Ok(true);
        } else if let Err(e) = conn.execute_batch("COMMIT") {
            warn!("Commit failed, rolling back: {}", e);
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            return Err(e.into());
        }
        Ok(false)
    }
}
