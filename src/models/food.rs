use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The slice of a catalog food the voting core needs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Food {
    pub id: i32,
    pub name: String,
}
