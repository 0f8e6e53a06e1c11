use log::info;
use mongodb::bson::doc;
use mongodb::error::{Error, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::models::{Invitation, Project, User};

pub const USERS: &str = "users";
pub const PROJECTS: &str = "projects";
pub const INVITATIONS: &str = "invitations";

const DUPLICATE_KEY: i32 = 11000;

pub struct MongoDB {
    pub db: Database,
}

impl MongoDB {
    /// Parses the URI and selects the database. The driver connects lazily,
    /// so this succeeds even while the server is still coming up.
    pub async fn init(uri: &str, db_name: &str) -> Result<Self, Error> {
        let client_options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(client_options)?;
        let db = client.database(db_name);
        Ok(MongoDB { db })
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection::<User>(USERS)
    }

    pub fn projects(&self) -> Collection<Project> {
        self.db.collection::<Project>(PROJECTS)
    }

    pub fn invitations(&self) -> Collection<Invitation> {
        self.db.collection::<Invitation>(INVITATIONS)
    }

    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users()
            .create_indexes(vec![
                IndexModel::builder()
                    .keys(doc! { "email": 1 })
                    .options(unique())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "username": 1 })
                    .options(unique())
                    .build(),
            ])
            .await?;
        self.projects()
            .create_index(IndexModel::builder().keys(doc! { "members": 1 }).build())
            .await?;
        self.invitations()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "recipient_id": 1, "status": 1 })
                    .build(),
            )
            .await?;

        info!("MongoDB indexes ensured");
        Ok(())
    }
}

/// True when the write was rejected by a unique index.
pub fn is_duplicate_key(err: &Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == DUPLICATE_KEY,
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY,
        _ => false,
    }
}
