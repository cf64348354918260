mod impls;
mod requests;
mod responses;
mod util;
mod veredicto;

pub use self::veredicto::*;
pub use impls::*;
pub use requests::*;
pub use responses::*;
pub use util::*;
