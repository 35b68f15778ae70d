pub(crate) mod blocked_apps;
mod settings;
