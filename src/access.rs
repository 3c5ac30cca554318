use crate::config::DashboardConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CurrentUser, Dashboard, DashboardAccess, NewUserPayload, Role, StatusResponse, UpdateUserPayload, UserRecord,
    UserSummary,
};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub fn role_display(role: Role) -> &'static str {
    role.display_name()
}

/// Users plus the dashboard registry, and every rule deciding who may see
/// what. Accounts live in memory and are seeded from configuration.
#[derive(Debug)]
pub struct UserStore {
    dashboards: Vec<Dashboard>,
    root_admin: String,
    users: RwLock<BTreeMap<String, UserRecord>>,
}

impl UserStore {
    pub fn new(dashboards: Vec<Dashboard>, users: Vec<UserRecord>, root_admin: impl Into<String>) -> Self {
        let users = users
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();
        Self {
            dashboards,
            root_admin: root_admin.into(),
            users: RwLock::new(users),
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(config.dashboards.clone(), config.users.clone(), config.root_admin.clone())
    }

    pub fn dashboards(&self) -> &[Dashboard] {
        &self.dashboards
    }

    pub fn dashboard(&self, dashboard_id: &str) -> Option<&Dashboard> {
        self.dashboards.iter().find(|dashboard| dashboard.id == dashboard_id)
    }

    pub fn can_access_dashboard(&self, user: Option<&CurrentUser>, dashboard_id: &str) -> bool {
        let Some(user) = user else {
            return false;
        };
        match self.dashboard(dashboard_id) {
            Some(dashboard) if dashboard.enabled => user.is_admin() || user.dashboard_access.allows(dashboard_id),
            _ => false,
        }
    }

    /// Enabled dashboards the user can open, in registry order.
    pub fn accessible_dashboards(&self, user: Option<&CurrentUser>) -> Vec<Dashboard> {
        self.dashboards
            .iter()
            .filter(|dashboard| self.can_access_dashboard(user, &dashboard.id))
            .cloned()
            .collect()
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<CurrentUser> {
        let users = self.read_users();
        match users.get(username) {
            Some(record) if record.password == password => {
                tracing::info!(username, role = record.role.as_str(), "user authenticated");
                Some(CurrentUser::from(record))
            }
            _ => {
                tracing::info!(username, "authentication rejected");
                None
            }
        }
    }

    /// Re-reads a user's current record, for sessions that outlive an update.
    pub fn current_user(&self, username: &str) -> Option<CurrentUser> {
        self.read_users().get(username).map(CurrentUser::from)
    }

    pub fn list_users(&self) -> Vec<UserSummary> {
        self.read_users()
            .values()
            .map(|record| UserSummary {
                username: record.username.clone(),
                name: record.name.clone(),
                role: record.role,
                role_display: role_display(record.role).to_string(),
                dashboard_access: effective_access(record),
            })
            .collect()
    }

    /// Display names of readonly users who can reach `dashboard_id`.
    pub fn readonly_users_for_dashboard(&self, dashboard_id: &str) -> Vec<String> {
        self.read_users()
            .values()
            .filter(|record| record.role == Role::Readonly && record.dashboards.allows(dashboard_id))
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn add_user(&self, payload: NewUserPayload) -> StatusResponse {
        into_status(self.try_add_user(payload), "User created successfully")
    }

    pub fn update_user(&self, username: &str, payload: UpdateUserPayload) -> StatusResponse {
        into_status(self.try_update_user(username, payload), "User updated successfully")
    }

    pub fn delete_user(&self, username: &str, current_username: &str) -> StatusResponse {
        into_status(
            self.try_delete_user(username, current_username),
            "User deleted successfully",
        )
    }

    fn try_add_user(&self, payload: NewUserPayload) -> AppResult<()> {
        let username = payload.username.trim().to_string();
        if username.is_empty() || payload.password.is_empty() {
            return Err(AppError::Validation("User ID and password are required".to_string()));
        }

        let mut users = self.write_users();
        if users.contains_key(&username) {
            return Err(AppError::Conflict("User ID already exists".to_string()));
        }

        let dashboards = match payload.role {
            Role::Admin => DashboardAccess::All,
            Role::Readonly => payload.dashboards,
        };
        tracing::info!(username = %username, role = payload.role.as_str(), "user created");
        users.insert(
            username.clone(),
            UserRecord {
                username,
                password: payload.password,
                role: payload.role,
                name: payload.name,
                dashboards,
            },
        );
        Ok(())
    }

    fn try_update_user(&self, username: &str, payload: UpdateUserPayload) -> AppResult<()> {
        let mut users = self.write_users();
        let record = users
            .get_mut(username)
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        if let Some(password) = payload.password.filter(|password| !password.is_empty()) {
            record.password = password;
        }
        if let Some(role) = payload.role {
            record.role = role;
            if role == Role::Admin {
                record.dashboards = DashboardAccess::All;
            }
        }
        if let Some(name) = payload.name.filter(|name| !name.is_empty()) {
            record.name = name;
        }
        // Only readonly users carry an explicit list.
        if let Some(dashboards) = payload.dashboards {
            if record.role == Role::Readonly {
                record.dashboards = dashboards;
            }
        }

        tracing::info!(username, role = record.role.as_str(), "user updated");
        Ok(())
    }

    fn try_delete_user(&self, username: &str, current_username: &str) -> AppResult<()> {
        let mut users = self.write_users();
        if !users.contains_key(username) {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        if username == current_username {
            return Err(AppError::Conflict("Cannot delete yourself".to_string()));
        }
        if username == self.root_admin {
            return Err(AppError::Conflict("Cannot delete admin user".to_string()));
        }

        users.remove(username);
        tracing::info!(username, deleted_by = current_username, "user deleted");
        Ok(())
    }

    fn read_users(&self) -> RwLockReadGuard<'_, BTreeMap<String, UserRecord>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_users(&self) -> RwLockWriteGuard<'_, BTreeMap<String, UserRecord>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn effective_access(record: &UserRecord) -> DashboardAccess {
    match record.role {
        Role::Admin => DashboardAccess::All,
        Role::Readonly => record.dashboards.clone(),
    }
}

fn into_status(result: AppResult<()>, success_message: &str) -> StatusResponse {
    match result {
        Ok(()) => StatusResponse::ok(success_message),
        Err(err) => StatusResponse::failed(err.detail()),
    }
}
