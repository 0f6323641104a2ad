use super::ReadingState;
use super::schema::Database;
use crate::error::Result;
use rusqlite::{OptionalExtension, params};

impl Database {
    /// Get reading state for a book.
    pub fn get_reading_state(&self, book_id: &str) -> Result<Option<ReadingState>> {
        self.read(|tx| {
            let state = tx
                .query_row(
                    "SELECT book_id, status, progress_percent, location_value, location_type,
                            location_source, spent_reading_minutes, remaining_time_minutes, updated_at
                     FROM reading_states WHERE book_id = ?1",
                    params![book_id],
                    |row| {
                        Ok(ReadingState {
                            book_id: row.get(0)?,
                            status: row.get(1)?,
                            progress_percent: row.get(2)?,
                            location_value: row.get(3)?,
                            location_type: row.get(4)?,
                            location_source: row.get(5)?,
                            spent_reading_minutes: row.get(6)?,
                            remaining_time_minutes: row.get(7)?,
                            updated_at: row.get(8)?,
                        })
                    },
                )
                .optional()?;
            Ok(state)
        })
    }

    /// Save reading state reported by a device.
    pub fn save_reading_state(&self, state: &ReadingState) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO reading_states
                 (book_id, status, progress_percent, location_value, location_type,
                  location_source, spent_reading_minutes, remaining_time_minutes, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.book_id,
                    state.status,
                    state.progress_percent,
                    state.location_value,
                    state.location_type,
                    state.location_source,
                    state.spent_reading_minutes,
                    state.remaining_time_minutes,
                    state.updated_at,
                ],
            )?;
            Ok(())
        })
    }
}
