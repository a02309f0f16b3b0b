//! User accounts, sessions and the bearer guard that checks them.

use axum::{
    extract::Path,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use modwire::{
    async_trait, Controller, ControllerConfig, Guard, GuardContext, Module, ModuleConfig,
    Problem, ProblemResponse, Resolver, RouteConfig,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

#[derive(Clone, Debug, Serialize)]
pub struct User {
    pub name: String,
    pub admin: bool,
    #[serde(skip)]
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

/// In-memory accounts. The first account created is an administrator.
#[derive(Default)]
pub struct UserStore {
    users: RwLock<BTreeMap<String, User>>,
}

impl UserStore {
    /// `None` when the name is taken.
    pub fn create(&self, name: &str, password: &str, admin: bool) -> Option<User> {
        let mut users = self.users.write();
        if users.contains_key(name) {
            return None;
        }
        let user = User {
            name: name.to_string(),
            admin: admin || users.is_empty(),
            password: password.to_string(),
        };
        users.insert(user.name.clone(), user.clone());
        Some(user)
    }

    pub fn get(&self, name: &str) -> Option<User> {
        self.users.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    pub fn verify(&self, name: &str, password: &str) -> Option<User> {
        self.get(name).filter(|u| u.password == password)
    }
}

/// Bearer token → user name.
#[derive(Default)]
pub struct Sessions {
    tokens: RwLock<HashMap<String, String>>,
}

impl Sessions {
    pub fn issue(&self, user: &str) -> String {
        let token = nanoid::nanoid!(32);
        self.tokens.write().insert(token.clone(), user.to_string());
        token
    }

    pub fn user_for(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Admits requests carrying a live session token.
///
/// A `"role": "admin"` entry in the route or controller metadata further
/// restricts the route to administrators.
pub struct BearerGuard {
    sessions: Arc<Sessions>,
    users: Arc<UserStore>,
}

impl BearerGuard {
    pub fn build(r: &Resolver<'_>) -> anyhow::Result<Arc<dyn Guard>> {
        Ok(Arc::new(Self {
            sessions: r.resolve()?,
            users: r.resolve()?,
        }))
    }
}

#[async_trait]
impl Guard for BearerGuard {
    async fn allow(&self, ctx: &GuardContext<'_>) -> anyhow::Result<bool> {
        let user = bearer_token(ctx.headers())
            .and_then(|token| self.sessions.user_for(token))
            .and_then(|name| self.users.get(&name));
        let Some(user) = user else {
            return Ok(false);
        };

        let admin_only =
            ctx.route_metadata()["role"] == "admin" || ctx.controller_metadata()["role"] == "admin";
        Ok(user.admin || !admin_only)
    }

    fn name(&self) -> &'static str {
        "bearer"
    }
}

fn not_found(name: &str) -> ProblemResponse {
    Problem::new(StatusCode::NOT_FOUND, "Not Found", format!("user '{name}' does not exist"))
        .with_code("user_not_found")
        .into()
}

pub(crate) fn user_exists(name: &str) -> ProblemResponse {
    Problem::new(StatusCode::CONFLICT, "Conflict", format!("user '{name}' already exists"))
        .with_code("user_exists")
        .into()
}

struct UsersController {
    users: Arc<UserStore>,
}

impl Controller for UsersController {
    fn config(&self) -> ControllerConfig {
        let list = self.users.clone();
        let one = self.users.clone();
        let create = self.users.clone();

        ControllerConfig::new("/users")
            .metadata(serde_json::json!({ "area": "users" }))
            .guard_with(BearerGuard::build)
            .route(RouteConfig::get("", move || {
                let users = list.clone();
                async move { Json(users.list()) }
            }))
            .route(RouteConfig::get("/{name}", move |Path(name): Path<String>| {
                let users = one.clone();
                async move { users.get(&name).map(Json).ok_or_else(|| not_found(&name)) }
            }))
            .route(
                RouteConfig::post("", move |Json(body): Json<Credentials>| {
                    let users = create.clone();
                    async move {
                        match users.create(&body.name, &body.password, false) {
                            Some(user) => Ok((StatusCode::CREATED, Json(user))),
                            None => Err(user_exists(&body.name)),
                        }
                    }
                })
                .metadata(serde_json::json!({ "role": "admin" })),
            )
    }
}

/// Owns the account store and sessions and exports both to importers.
pub struct UsersModule;

impl Module for UsersModule {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new()
            .provide_value(Arc::new(UserStore::default()))
            .provide_value(Arc::new(Sessions::default()))
            .export::<UserStore>()
            .export::<Sessions>()
            .controller(|r| {
                Ok(Arc::new(UsersController {
                    users: r.resolve()?,
                }))
            })
    }
}
