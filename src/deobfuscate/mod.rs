pub mod eval;
pub mod mappings;
pub mod proxy_calls;
pub mod static_array;
pub mod string_array;
