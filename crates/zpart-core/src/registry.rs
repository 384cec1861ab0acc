//! 文档注册表
//!
//! 创建并持有装配模型，负责分配文档标识符。标识符单调递增，在注册表存活期间不复用。

use crate::model::{AssemblyModel, DocumentId};
use tracing::info;

/// 文档注册表
#[derive(Debug, Default)]
pub struct DocumentRegistry {
    documents: Vec<AssemblyModel>,
    next_id: u32,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建空文档并返回其标识符
    ///
    /// `structured` 区分多零件装配文档与扁平文档。
    pub fn add_document(&mut self, name: impl Into<String>, structured: bool) -> DocumentId {
        let id = DocumentId(self.next_id);
        self.next_id += 1;
        let model = AssemblyModel::new(id, name, structured);
        info!("Added document {} '{}'", id, model.name());
        self.documents.push(model);
        id
    }

    pub fn document(&self, id: DocumentId) -> Option<&AssemblyModel> {
        self.documents.iter().find(|d| d.id() == id)
    }

    pub fn document_mut(&mut self, id: DocumentId) -> Option<&mut AssemblyModel> {
        self.documents.iter_mut().find(|d| d.id() == id)
    }

    /// 按创建顺序遍历文档
    pub fn documents(&self) -> impl Iterator<Item = &AssemblyModel> {
        self.documents.iter()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// 释放文档
    ///
    /// 释放前为每个实体发出 `EntityAboutToBeDestroyed`。返回文档是否存在。
    pub fn erase_document(&mut self, id: DocumentId) -> bool {
        let Some(index) = self.documents.iter().position(|d| d.id() == id) else {
            return false;
        };
        let mut model = self.documents.remove(index);
        model.notify_close();
        info!("Erased document {} '{}'", id, model.name());
        true
    }
}
