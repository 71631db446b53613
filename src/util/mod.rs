pub mod leftover;
pub mod paren;
pub mod promise;
