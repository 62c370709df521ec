//! General utility code that didn't fit anywhere else

mod keys;
pub(crate) use keys::AuthorizedKeys;

mod tracing;
pub(crate) use tracing::{
    is_initialized as tracing_is_initialised, setup as setup_tracing, trace_level,
};
