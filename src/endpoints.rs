//! Backend paths, relative to the configured base URL.

pub const AUTH: &str = "/users/auth";
pub const AUTH_REFRESH: &str = "/users/auth/refresh";
pub const AUTH_SWITCH_ORG: &str = "/users/auth/switch-org";
pub const ORGANIZATIONS: &str = "/organizations";
pub const BILLING: &str = "/billing";
pub const WEBHOOKS: &str = "/webhooks";
pub const API_KEYS: &str = "/api-keys";
pub const NOTIFICATIONS: &str = "/notifications";
pub const INVOLVEMENT: &str = "/involvement";
pub const TEST_CASE: &str = "/test-case";
pub const TEST_EXECUTION: &str = "/test-execution";
pub const DEVICE: &str = "/device";
pub const HABILITY: &str = "/hability";
pub const REPORT: &str = "/report";
pub const TEMPLATE: &str = "/template";
