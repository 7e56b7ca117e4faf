mod file;
mod folder;
mod project;

pub use file::{File, FileVersion};
pub use folder::Folder;
pub use project::{Project, ProjectStatus};
