use crate::ai::AiService;
use crate::auth::TokenBlacklist;
use crate::config::Config;
use crate::db::MongoDB;
use crate::execution::CodeRunner;
use crate::project_hub::ProjectHub;
use actix::Addr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Addr<ProjectHub>,
    pub mongodb: Arc<MongoDB>,
    pub config: Config,
    pub revoked_tokens: TokenBlacklist,
    pub runner: CodeRunner,
    pub ai: Arc<AiService>,
}
