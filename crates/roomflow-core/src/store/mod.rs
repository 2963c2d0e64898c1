pub mod instance_store;
pub mod task_store;
pub mod template_store;

pub use instance_store::InstanceStore;
pub use task_store::TaskStore;
pub use template_store::TemplateStore;
