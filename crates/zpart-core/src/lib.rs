//! ZPart 核心
//!
//! 提供装配结构的内存表示：
//! - `tree`: 句柄索引的只追加层次树
//! - `shape`: 外部几何文档（装配、组件、零件、子形状）
//! - `model`: 装配模型，持有几何文档及其模型树，并发出结构变化通知
//! - `registry`: 文档注册表，分配文档标识符
//!
//! # 示例
//!
//! ```rust
//! use zpart_core::prelude::*;
//!
//! let mut registry = DocumentRegistry::new();
//! let id = registry.add_document("Untitled", true);
//! let model = registry.document_mut(id).unwrap();
//! model
//!     .xcaf_import(|shapes| -> Result<(), ShapeError> {
//!         shapes.add_part(Some("Bracket".into()), ShapeType::Solid, None);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(model.entities().len(), 1);
//! ```

pub mod mesh;
pub mod model;
pub mod registry;
pub mod shape;
pub mod tree;

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::mesh::TriangleMesh;
    pub use crate::model::{ApplicationItem, AssemblyModel, DocumentId, ModelEvent, ModelObserver};
    pub use crate::registry::DocumentRegistry;
    pub use crate::shape::{LabelId, ShapeDocument, ShapeError, ShapeType};
    pub use crate::tree::{deep_foreach_tree_node, IndexedTree, TreeNodeId};
}
