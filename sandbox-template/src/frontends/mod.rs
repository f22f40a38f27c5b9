mod builtin;
mod template_file;

pub use builtin::BuiltinFrontend;
pub use template_file::{find_template_file, TemplateFileFrontend, TEMPLATE_FILE_NAMES};
