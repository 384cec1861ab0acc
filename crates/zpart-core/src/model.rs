//! 装配模型
//!
//! `AssemblyModel` 持有一个几何文档和一棵由它派生的模型树（`IndexedTree<LabelId>`）。
//! 模型树的根是文档的自由形状，称为"实体"。
//!
//! 结构变化通过 `ModelEvent` 同步通知观察者，顺序与变化发生顺序一致。
//!
//! # 删除与重建
//!
//! 模型树不支持删除节点。`destroy_entity` 删除底层文档中的形状后，
//! 该实体的节点及其子树变为过期状态，在下一次 `rebuild_model_tree` 之前
//! 不得再解引用（`label` 会 panic）。需要准确结构的调用方必须先重建。

use crate::shape::{LabelId, ShapeDocument};
use crate::tree::{deep_foreach_tree_node_from, IndexedTree, TreeNodeId};
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// 文档标识符，由注册表分配且不复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u32);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc{}", self.0)
    }
}

/// 结构变化通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    /// 新的顶层实体可见
    EntityAdded {
        document: DocumentId,
        node: TreeNodeId,
    },
    /// 实体即将被销毁（在修改之前发出）
    EntityAboutToBeDestroyed {
        document: DocumentId,
        node: TreeNodeId,
    },
}

impl ModelEvent {
    pub fn node(&self) -> TreeNodeId {
        match self {
            ModelEvent::EntityAdded { node, .. } | ModelEvent::EntityAboutToBeDestroyed { node, .. } => {
                *node
            }
        }
    }
}

/// 模型观察者
pub trait ModelObserver: Send {
    fn on_model_event(&mut self, event: &ModelEvent);
}

/// 通道发送端可直接作为观察者；接收端已关闭时事件被丢弃
impl ModelObserver for crossbeam::channel::Sender<ModelEvent> {
    fn on_model_event(&mut self, event: &ModelEvent) {
        if self.send(*event).is_err() {
            trace!("Model event receiver disconnected, dropping {:?}", event);
        }
    }
}

/// 装配模型
pub struct AssemblyModel {
    /// 标识符（创建后不可变）
    id: DocumentId,

    /// 显示名称
    name: String,

    /// 来源文件路径
    file_path: Option<PathBuf>,

    /// 是否为结构化（多零件装配）文档
    structured: bool,

    /// 底层几何文档
    shapes: ShapeDocument,

    /// 模型树，节点数据为文档标签
    model_tree: IndexedTree<LabelId>,

    /// 已销毁、等待重建的节点
    stale: HashSet<TreeNodeId>,

    /// 观察者列表
    observers: Vec<Box<dyn ModelObserver>>,
}

impl fmt::Debug for AssemblyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssemblyModel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("file_path", &self.file_path)
            .field("structured", &self.structured)
            .field("nodes", &self.model_tree.len())
            .field("stale", &self.stale.len())
            .finish_non_exhaustive()
    }
}

impl AssemblyModel {
    /// 创建空模型（由注册表调用）
    pub(crate) fn new(id: DocumentId, name: impl Into<String>, structured: bool) -> Self {
        Self {
            id,
            name: name.into(),
            file_path: None,
            structured,
            shapes: ShapeDocument::new(),
            model_tree: IndexedTree::new(),
            stale: HashSet::new(),
            observers: Vec::new(),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn set_file_path(&mut self, path: impl AsRef<Path>) {
        self.file_path = Some(path.as_ref().to_path_buf());
    }

    pub fn is_structured(&self) -> bool {
        self.structured
    }

    /// 底层几何文档（只读）
    pub fn shapes(&self) -> &ShapeDocument {
        &self.shapes
    }

    /// 模型树
    pub fn model_tree(&self) -> &IndexedTree<LabelId> {
        &self.model_tree
    }

    /// 注册观察者
    pub fn add_observer(&mut self, observer: Box<dyn ModelObserver>) {
        self.observers.push(observer);
    }

    fn emit(&mut self, event: ModelEvent) {
        for observer in &mut self.observers {
            observer.on_model_event(&event);
        }
    }

    /// 是否有销毁操作等待重建
    pub fn needs_rebuild(&self) -> bool {
        !self.stale.is_empty()
    }

    /// 节点是否已过期
    pub fn is_stale(&self, node: TreeNodeId) -> bool {
        self.stale.contains(&node)
    }

    /// 节点是否为实体（未过期的根节点），O(1)
    pub fn is_entity(&self, node: TreeNodeId) -> bool {
        self.model_tree.node_is_root(node) && !self.stale.contains(&node)
    }

    /// 当前可见的实体
    pub fn entities(&self) -> Vec<TreeNodeId> {
        self.model_tree
            .roots()
            .iter()
            .copied()
            .filter(|node| !self.stale.contains(node))
            .collect()
    }

    /// 节点对应的文档标签；未知节点返回空标签
    ///
    /// # Panics
    ///
    /// 节点已过期（实体被销毁后尚未重建）时 panic。
    pub fn label(&self, node: TreeNodeId) -> LabelId {
        if self.stale.contains(&node) {
            panic!(
                "AssemblyModel::label: node {node} of {} was destroyed, rebuild the model tree first",
                self.id
            );
        }
        *self.model_tree.node_data(node)
    }

    /// 节点显示名称
    pub fn node_name(&self, node: TreeNodeId) -> String {
        self.shapes.find_label_name(self.label(node))
    }

    /// 沿模型树向上累积组件定位，得到节点的绝对定位
    pub fn shape_absolute_location(&self, node: TreeNodeId) -> Isometry3<f64> {
        let mut absolute = Isometry3::identity();
        let mut it = node;
        while !it.is_null() {
            let local = self.shapes.location(self.label(it));
            absolute = local * absolute;
            it = self.model_tree.node_parent(it);
        }
        absolute
    }

    /// 清空并按文档当前结构重建模型树
    pub fn rebuild_model_tree(&mut self) {
        self.model_tree.clear();
        self.stale.clear();
        for root in self.shapes.free_shapes() {
            self.deep_build_model_tree(TreeNodeId::NULL, root);
        }
        debug!(
            "Rebuilt model tree of {}: {} nodes, {} entities",
            self.id,
            self.model_tree.len(),
            self.model_tree.roots().len()
        );
    }

    fn deep_build_model_tree(&mut self, parent: TreeNodeId, label: LabelId) {
        let node = self.model_tree.append_child(parent, label);
        if self.shapes.is_assembly(label) {
            let components = self.shapes.components(label).to_vec();
            for child in components {
                self.deep_build_model_tree(node, child);
            }
        } else if self.shapes.is_simple(label) {
            let subs = self.shapes.sub_shapes(label).to_vec();
            for child in subs {
                self.deep_build_model_tree(node, child);
            }
        } else if self.shapes.is_reference(label) {
            let referred = self.shapes.referred(label);
            self.deep_build_model_tree(node, referred);
        }
    }

    /// 销毁实体
    ///
    /// 先同步发出 `EntityAboutToBeDestroyed`，再从几何文档删除形状。
    /// 该节点及其子树随即过期，直到下一次 `rebuild_model_tree`。
    ///
    /// # Panics
    ///
    /// `node` 不是实体（非根、未知或已销毁）时 panic。
    pub fn destroy_entity(&mut self, node: TreeNodeId) {
        if !self.is_entity(node) {
            panic!(
                "AssemblyModel::destroy_entity: node {node} is not a live entity of {}",
                self.id
            );
        }

        self.emit(ModelEvent::EntityAboutToBeDestroyed {
            document: self.id,
            node,
        });

        let label = *self.model_tree.node_data(node);
        self.shapes.remove_shape_tree(label);

        let mut subtree = Vec::new();
        deep_foreach_tree_node_from(node, &self.model_tree, &mut |n| subtree.push(n));
        self.stale.extend(subtree);
        debug!("Destroyed entity {} ({}) of {}", node, label, self.id);
    }

    /// 发出所有实体的销毁通知（注册表释放模型前调用）
    pub(crate) fn notify_close(&mut self) {
        for node in self.entities() {
            self.emit(ModelEvent::EntityAboutToBeDestroyed {
                document: self.id,
                node,
            });
        }
    }

    /// 结构化导入
    ///
    /// `fn_import` 独占几何文档的写权限。返回错误时文档恢复到调用前的状态，
    /// 模型树不受影响；成功时重建模型树，并为每个新出现的实体发出 `EntityAdded`。
    pub fn xcaf_import<E, F>(&mut self, fn_import: F) -> Result<(), E>
    where
        F: FnOnce(&mut ShapeDocument) -> Result<(), E>,
    {
        let mut scope = ImportScope::begin(self);
        fn_import(scope.shapes_mut())?;
        scope.commit();
        Ok(())
    }

    /// 单形状导入
    ///
    /// 先创建一个新的顶层简单形状，再把它交给 `fn_import` 填充。失败语义同 `xcaf_import`。
    pub fn single_import<E, F>(&mut self, fn_import: F) -> Result<(), E>
    where
        F: FnOnce(&mut ShapeDocument, LabelId) -> Result<(), E>,
    {
        let mut scope = ImportScope::begin(self);
        let shapes = scope.shapes_mut();
        let label = shapes.add_part(None, crate::shape::ShapeType::Solid, None);
        fn_import(shapes, label)?;
        scope.commit();
        Ok(())
    }
}

/// 导入作用域
///
/// 持有模型的独占借用和几何文档快照。未提交就被丢弃（提前返回、panic）时恢复快照。
struct ImportScope<'a> {
    model: &'a mut AssemblyModel,
    snapshot: Option<ShapeDocument>,
    entities_before: HashSet<LabelId>,
}

impl<'a> ImportScope<'a> {
    fn begin(model: &'a mut AssemblyModel) -> Self {
        let entities_before = model
            .entities()
            .into_iter()
            .map(|node| *model.model_tree.node_data(node))
            .collect();
        let snapshot = Some(model.shapes.clone());
        Self {
            model,
            snapshot,
            entities_before,
        }
    }

    fn shapes_mut(&mut self) -> &mut ShapeDocument {
        &mut self.model.shapes
    }

    fn commit(mut self) {
        self.snapshot = None;
        self.model.rebuild_model_tree();

        let added: Vec<TreeNodeId> = self
            .model
            .model_tree
            .roots()
            .iter()
            .copied()
            .filter(|node| !self.entities_before.contains(self.model.model_tree.node_data(*node)))
            .collect();
        let document = self.model.id;
        for node in added {
            self.model.emit(ModelEvent::EntityAdded { document, node });
        }
    }
}

impl Drop for ImportScope<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug!("Import into {} failed, restoring document", self.model.id);
            self.model.shapes = snapshot;
        }
    }
}

/// 应用程序项：导出选择的单位
#[derive(Debug, Clone, Copy)]
pub struct ApplicationItem<'a> {
    /// 所属模型
    pub document: &'a AssemblyModel,
    /// 模型树节点；`None` 表示整个文档
    pub node: Option<TreeNodeId>,
}

impl<'a> ApplicationItem<'a> {
    /// 整个文档
    pub fn document(document: &'a AssemblyModel) -> Self {
        Self {
            document,
            node: None,
        }
    }

    /// 文档中的一个节点
    pub fn node(document: &'a AssemblyModel, node: TreeNodeId) -> Self {
        Self {
            document,
            node: Some(node),
        }
    }

    /// 选择所覆盖的文档标签
    ///
    /// # Panics
    ///
    /// 节点已过期时 panic（见 `AssemblyModel::label`）。
    pub fn labels(&self) -> Vec<LabelId> {
        match self.node {
            None => self.document.shapes().free_shapes(),
            Some(node) => {
                let label = self.document.label(node);
                if label.is_null() {
                    Vec::new()
                } else {
                    vec![label]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ShapeError, ShapeType};
    use crate::tree::deep_foreach_tree_node;
    use crossbeam::channel::{unbounded, Receiver};

    fn model_with_events() -> (AssemblyModel, Receiver<ModelEvent>) {
        let mut model = AssemblyModel::new(DocumentId(0), "test", true);
        let (tx, rx) = unbounded::<ModelEvent>();
        model.add_observer(Box::new(tx));
        (model, rx)
    }

    fn populate(shapes: &mut ShapeDocument) -> Result<(), String> {
        let asm = shapes.add_assembly(Some("asm".into()));
        let part = shapes.add_part(Some("part".into()), ShapeType::Solid, None);
        shapes
            .add_sub_shape(part, ShapeType::Face, None)
            .map_err(|e| e.to_string())?;
        shapes
            .add_component(asm, part, Isometry3::translation(1.0, 0.0, 0.0), None)
            .map_err(|e| e.to_string())?;
        shapes
            .add_component(asm, part, Isometry3::translation(0.0, 2.0, 0.0), None)
            .map_err(|e| e.to_string())?;
        shapes.add_part(Some("loose".into()), ShapeType::Solid, None);
        Ok(())
    }

    #[test]
    fn test_xcaf_import_builds_tree_and_notifies() {
        let (mut model, rx) = model_with_events();
        model.xcaf_import(populate).unwrap();

        // asm -> 2 × (component -> part -> face), loose
        assert_eq!(model.model_tree().len(), 1 + 2 * 3 + 1);
        let entities = model.entities();
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| model.is_entity(*e)));

        let events: Vec<ModelEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            entities
                .iter()
                .map(|&node| ModelEvent::EntityAdded {
                    document: DocumentId(0),
                    node
                })
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (mut model, _rx) = model_with_events();
        model.xcaf_import(populate).unwrap();

        let mut first = Vec::new();
        deep_foreach_tree_node(model.model_tree(), |n| first.push(*model.model_tree().node_data(n)));
        model.rebuild_model_tree();
        model.rebuild_model_tree();
        let mut second = Vec::new();
        deep_foreach_tree_node(model.model_tree(), |n| second.push(*model.model_tree().node_data(n)));

        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_import_leaves_model_untouched() {
        let (mut model, rx) = model_with_events();
        model.xcaf_import(populate).unwrap();
        let _ = rx.try_iter().count();
        let labels_before = model.shapes().len();
        let nodes_before = model.model_tree().len();

        let result: Result<(), &str> = model.xcaf_import(|shapes| {
            shapes.add_part(Some("half-built".into()), ShapeType::Solid, None);
            Err("malformed input")
        });

        assert_eq!(result, Err("malformed input"));
        assert_eq!(model.shapes().len(), labels_before);
        assert_eq!(model.model_tree().len(), nodes_before);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_second_import_notifies_only_new_entities() {
        let (mut model, rx) = model_with_events();
        model.xcaf_import(populate).unwrap();
        let _ = rx.try_iter().count();

        model
            .single_import(|shapes, label| -> Result<(), ShapeError> {
                shapes.set_name(label, "scan");
                Ok(())
            })
            .unwrap();

        let events: Vec<ModelEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(model.node_name(events[0].node()), "scan");
        assert_eq!(model.entities().len(), 3);
    }

    #[test]
    fn test_destroy_entity_notifies_once_then_disappears_on_rebuild() {
        let (mut model, rx) = model_with_events();
        model.xcaf_import(populate).unwrap();
        let _ = rx.try_iter().count();

        let target = model.entities()[0];
        let target_label = model.label(target);
        model.destroy_entity(target);

        let events: Vec<ModelEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![ModelEvent::EntityAboutToBeDestroyed {
                document: DocumentId(0),
                node: target
            }]
        );
        assert!(model.needs_rebuild());
        assert!(!model.is_entity(target));

        model.rebuild_model_tree();
        assert!(!model.needs_rebuild());
        assert_eq!(model.entities().len(), 1);
        let mut labels = Vec::new();
        deep_foreach_tree_node(model.model_tree(), |n| labels.push(model.label(n)));
        assert!(!labels.contains(&target_label));
    }

    #[test]
    #[should_panic(expected = "was destroyed")]
    fn test_stale_handle_dereference_panics() {
        let (mut model, _rx) = model_with_events();
        model.xcaf_import(populate).unwrap();
        let target = model.entities()[0];
        let child = model.model_tree().node_child_first(target);
        model.destroy_entity(target);
        model.label(child);
    }

    #[test]
    fn test_absolute_location_accumulates() {
        let (mut model, _rx) = model_with_events();
        model.xcaf_import(populate).unwrap();
        let asm = model.entities()[0];
        let second_component = model.model_tree().node_child_last(asm);
        let part = model.model_tree().node_child_first(second_component);

        let location = model.shape_absolute_location(part);
        assert_eq!(location.translation.vector, nalgebra::Vector3::new(0.0, 2.0, 0.0));
    }
}
