use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::BoardStore;
use crate::models::CardPlacement;

/// Append positions grow by one per card; once the maximum sibling position
/// reaches this threshold the list is renumbered before the next append so
/// the column never overflows its 32-bit storage.
pub const INT4_SAFE_THRESHOLD: i32 = i32::MAX - 7;

impl BoardStore {
    /// Next position for appending a card to a list.
    ///
    /// Empty list yields 0. When the current maximum has climbed to
    /// `INT4_SAFE_THRESHOLD` or beyond, existing siblings are compacted to
    /// their 0-based ranks first and the append lands after them.
    pub fn next_append_position(&self, list_id: &str) -> Result<i32> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM card_placements WHERE list_id = ?1",
                params![list_id],
                |row| row.get(0),
            )
            .context("Failed to read max position")?;
        if max < 0 {
            return Ok(0);
        }
        if max >= INT4_SAFE_THRESHOLD as i64 {
            let count = self.compact_list(list_id)?;
            return Ok(count);
        }
        Ok(max as i32 + 1)
    }

    /// Position for inserting a card at a rank within a list, renumbering
    /// siblings to open a gap. `None`, negative, and out-of-range indexes
    /// all behave as append.
    pub fn insert_at_index(&self, list_id: &str, index: Option<i64>) -> Result<i32> {
        let siblings = self.list_placements(list_id)?;
        let count = siblings.len();

        let index = match index {
            Some(i) if i >= 0 && (i as usize) < count => i as usize,
            _ => {
                // Append: compact existing ranks and land after them.
                let count = self.compact_list(list_id)?;
                return Ok(count);
            }
        };

        // The store sits behind a mutex, so a shared-ref transaction is safe.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin renumber transaction")?;
        for (rank, placement) in siblings.iter().enumerate() {
            let new_pos = if rank < index { rank } else { rank + 1 } as i32;
            tx.execute(
                "UPDATE card_placements SET position = ?1 WHERE card_id = ?2 AND list_id = ?3",
                params![new_pos, placement.card_id, placement.list_id],
            )
            .context("Failed to renumber placement")?;
        }
        tx.commit().context("Failed to commit renumbering")?;
        Ok(index as i32)
    }

    /// Rewrite every sibling's position to its 0-based rank, preserving
    /// relative order. Returns the sibling count.
    fn compact_list(&self, list_id: &str) -> Result<i32> {
        let siblings = self.list_placements(list_id)?;

        // The store sits behind a mutex, so a shared-ref transaction is safe.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin compaction transaction")?;
        for (rank, placement) in siblings.iter().enumerate() {
            tx.execute(
                "UPDATE card_placements SET position = ?1 WHERE card_id = ?2 AND list_id = ?3",
                params![rank as i32, placement.card_id, placement.list_id],
            )
            .context("Failed to compact placement")?;
        }
        tx.commit().context("Failed to commit compaction")?;
        Ok(siblings.len() as i32)
    }

    pub fn create_placement(
        &self,
        card_id: &str,
        list_id: &str,
        position: i32,
        is_mirror: bool,
    ) -> Result<CardPlacement> {
        self.conn
            .execute(
                "INSERT INTO card_placements (card_id, list_id, position, is_mirror) VALUES (?1, ?2, ?3, ?4)",
                params![card_id, list_id, position, is_mirror as i32],
            )
            .context("Failed to insert placement")?;
        Ok(CardPlacement {
            card_id: card_id.to_string(),
            list_id: list_id.to_string(),
            position,
            is_mirror,
        })
    }

    /// Placements in a list, ordered by position ascending.
    pub fn list_placements(&self, list_id: &str) -> Result<Vec<CardPlacement>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT card_id, list_id, position, is_mirror
                 FROM card_placements WHERE list_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_placements")?;
        let rows = stmt
            .query_map(params![list_id], |row| {
                Ok(CardPlacement {
                    card_id: row.get(0)?,
                    list_id: row.get(1)?,
                    position: row.get(2)?,
                    is_mirror: row.get::<_, i64>(3)? != 0,
                })
            })
            .context("Failed to query placements")?;
        let mut placements = Vec::new();
        for row in rows {
            placements.push(row.context("Failed to read placement row")?);
        }
        Ok(placements)
    }
}
