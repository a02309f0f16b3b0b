use axum::{
    http::{HeaderMap, StatusCode},
    Json,
};
use modwire::{Controller, ControllerConfig, Module, ModuleConfig, Problem, ProblemResponse, RouteConfig};
use std::sync::Arc;

use super::users::{bearer_token, user_exists, BearerGuard, Credentials, Sessions, User, UserStore, UsersModule};

/// Sign-up and sign-in over the stores exported by [`UsersModule`].
pub struct AuthService {
    users: Arc<UserStore>,
    sessions: Arc<Sessions>,
}

impl AuthService {
    pub fn new(users: Arc<UserStore>, sessions: Arc<Sessions>) -> Self {
        Self { users, sessions }
    }

    pub fn signup(&self, creds: &Credentials) -> Option<User> {
        self.users.create(&creds.name, &creds.password, false)
    }

    /// A fresh session token, or `None` for unknown credentials.
    pub fn signin(&self, creds: &Credentials) -> Option<String> {
        self.users
            .verify(&creds.name, &creds.password)
            .map(|user| self.sessions.issue(&user.name))
    }

    pub fn whoami(&self, token: &str) -> Option<User> {
        self.sessions
            .user_for(token)
            .and_then(|name| self.users.get(&name))
    }
}

fn unauthorized() -> ProblemResponse {
    Problem::new(StatusCode::UNAUTHORIZED, "Unauthorized", "invalid name or password")
        .with_code("invalid_credentials")
        .into()
}

struct AuthController {
    auth: Arc<AuthService>,
}

impl Controller for AuthController {
    fn config(&self) -> ControllerConfig {
        let signup = self.auth.clone();
        let signin = self.auth.clone();
        let me = self.auth.clone();

        ControllerConfig::new("/auth")
            .route(RouteConfig::post("/signup", move |Json(creds): Json<Credentials>| {
                let auth = signup.clone();
                async move {
                    auth.signup(&creds)
                        .map(|user| (StatusCode::CREATED, Json(user)))
                        .ok_or_else(|| user_exists(&creds.name))
                }
            }))
            .route(RouteConfig::post("/signin", move |Json(creds): Json<Credentials>| {
                let auth = signin.clone();
                async move {
                    auth.signin(&creds)
                        .map(|token| Json(serde_json::json!({ "token": token })))
                        .ok_or_else(unauthorized)
                }
            }))
            .route(
                RouteConfig::get("/me", move |headers: HeaderMap| {
                    let auth = me.clone();
                    async move {
                        bearer_token(&headers)
                            .and_then(|token| auth.whoami(token))
                            .map(Json)
                            .ok_or_else(unauthorized)
                    }
                })
                .guard_with(BearerGuard::build),
            )
    }
}

pub struct AuthModule;

impl Module for AuthModule {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new()
            .import(UsersModule)
            .provide(|r| Ok(Arc::new(AuthService::new(r.resolve()?, r.resolve()?))))
            .controller(|r| {
                Ok(Arc::new(AuthController {
                    auth: r.resolve()?,
                }))
            })
    }
}
