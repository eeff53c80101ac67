mod path;

pub use path::{
    Error, Result, database_path, expand_tilde, resolve_state_dir, spool_dir,
};
