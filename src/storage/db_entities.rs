//! SeaORM entity models for the SQLite database.
//!
//! Tables created by `database::connect`:
//! - `secrets`: encoded `EncryptedBlob`s keyed by (kind, id)
//! - `servers`: remote targets
//! - `credentials`: SSH identity metadata (the key itself lives in `secrets`)
//! - `history`: one row per one-shot execution, command and output encrypted

/// Secrets table entity model.
pub mod secrets {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "secrets")]
    pub struct Model {
        /// "credential", "script" or "variable"
        #[sea_orm(primary_key, auto_increment = false)]
        pub kind: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        /// `EncryptedBlob::encode` output
        pub blob: Vec<u8>,
        /// RFC3339 timestamp of the last write
        pub updated_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Servers table entity model.
pub mod servers {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "servers")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub name: String,
        pub hostname: String,
        pub port: i32,
        pub username: String,
        pub group_name: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Credentials table entity model.
pub mod credentials {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "credentials")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub name: String,
        pub group_name: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// History table entity model.
pub mod history {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "history")]
    pub struct Model {
        /// UUID as string primary key
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        /// Encoded encrypted command text
        pub command: Vec<u8>,
        /// Encoded encrypted combined output
        pub output: Vec<u8>,
        pub exit_code: Option<i32>,
        pub target_label: String,
        pub identity: String,
        /// `HistoryStatus` as snake_case string
        pub status: String,
        /// RFC3339 start timestamp
        pub started_at: String,
        pub duration_ms: i64,
        pub timed_out: bool,
        pub truncated: bool,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
