pub mod checksum;
pub mod counter;
pub mod definitions;
pub mod prelude;
pub mod value_id;

/// Declares a private module and re-exports its contents.
#[macro_export]
macro_rules! submodule {
    ($name:ident) => {
        mod $name;
        pub use $name::*;
    };
}
