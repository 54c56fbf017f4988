mod local_process_ex_mgr;

pub use local_process_ex_mgr::*;
