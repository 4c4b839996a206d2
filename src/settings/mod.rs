//! Settings store (C1): the single JSON settings document, cached,
//! atomically persisted, and broadcast to interested subsystems on change.

pub mod document;
pub mod env;
pub mod store;

pub use document::{
    ConnectorOptions, Group, GroupMember, McpRouterConfig, OpenApiConfig, OpenApiSecurity,
    RoutingConfig, SecurityKind, SecurityLocation, ServerConfig, ServerKind, SettingsDocument,
    SmartRoutingConfig, SystemConfig, ToolOverride, ToolSelector, UserAccount, UserConfig,
};
pub use store::{SettingsChangeEvent, SettingsStore};
