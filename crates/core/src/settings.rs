use crate::models::ParameterScopes;

/// Parameter controlling whether statuses are published at all.
pub const PUBLISHING_ENABLED_PARAM: &str = "commitStatusPublisher.enabled";

/// Resolves the publishing flag for a build.
///
/// A build configuration parameter overrides project parameters (nearest project first),
/// which override the server-wide setting.
pub fn publishing_enabled(parameters: &ParameterScopes, global: bool) -> bool {
    match parameters.resolve(PUBLISHING_ENABLED_PARAM) {
        Some(value) => parse_bool(value),
        None => global,
    }
}

/// Anything other than `true` (ignoring case and surrounding whitespace) is false.
pub fn parse_bool(value: &str) -> bool { value.trim().eq_ignore_ascii_case("true") }
