#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::sync::Once;

pub use log::Level;

static INIT: Once = Once::new();

///
/// Initializes process-wide logging at the given level. Idempotent: the first caller wins, and
/// later calls (from a different crate's tests, say) are silently ignored rather than causing
/// `env_logger`'s "attempted to set a logger after the logging system was already initialized"
/// panic.
///
pub fn init(level: Level) {
    INIT.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level.to_level_filter())
            .format_timestamp_millis()
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(Level::Debug);
        init(Level::Trace);
        log::info!("logging initialized twice without panicking");
    }
}
