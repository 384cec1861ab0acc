//! 几何文档（标签图）
//!
//! `ShapeDocument` 是装配模型背后的外部几何文档：
//! - 装配（Assembly）：由若干组件构成
//! - 组件 / 参照（Reference）：带定位地引用另一个形状
//! - 简单形状（Simple）：零件，可带三角网格和子形状
//! - 子形状（SubShape）：简单形状的面、边等
//!
//! 没有被任何组件引用的顶层形状称为"自由形状"，它们是模型树的根。

use crate::mesh::TriangleMesh;
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// 装配允许的最大嵌套层数
pub const MAX_NESTING_DEPTH: usize = 256;

/// 标签标识符，`0` 表示空标签
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct LabelId(pub u32);

impl LabelId {
    /// 空标签
    pub const NULL: LabelId = LabelId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0:1:{}", self.0)
    }
}

/// 拓扑类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeType {
    Compound,
    CompSolid,
    Solid,
    Shell,
    Face,
    Wire,
    Edge,
    Vertex,
}

impl ShapeType {
    pub fn name(&self) -> &'static str {
        match self {
            ShapeType::Compound => "Compound",
            ShapeType::CompSolid => "CompSolid",
            ShapeType::Solid => "Solid",
            ShapeType::Shell => "Shell",
            ShapeType::Face => "Face",
            ShapeType::Wire => "Wire",
            ShapeType::Edge => "Edge",
            ShapeType::Vertex => "Vertex",
        }
    }

    /// 按名称解析（不区分大小写）
    pub fn from_name(name: &str) -> Option<Self> {
        let all = [
            ShapeType::Compound,
            ShapeType::CompSolid,
            ShapeType::Solid,
            ShapeType::Shell,
            ShapeType::Face,
            ShapeType::Wire,
            ShapeType::Edge,
            ShapeType::Vertex,
        ];
        all.into_iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

/// 标签种类
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LabelKind {
    /// 装配，按顺序持有组件（参照标签）
    Assembly { components: Vec<LabelId> },
    /// 简单形状
    Simple {
        shape_type: ShapeType,
        mesh: Option<TriangleMesh>,
        sub_shapes: Vec<LabelId>,
    },
    /// 组件：带定位引用另一个形状
    Reference {
        referred: LabelId,
        location: Isometry3<f64>,
    },
    /// 子形状
    SubShape { shape_type: ShapeType },
}

/// 文档中的一个标签
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    /// 所属标签（组件属于装配，子形状属于简单形状，顶层形状为空）
    pub father: LabelId,
    /// 名称属性
    pub name: Option<String>,
    /// 种类和数据
    pub kind: LabelKind,
}

/// 几何文档操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Unknown label: {0}")]
    UnknownLabel(LabelId),

    #[error("Label {0} is not an assembly")]
    NotAnAssembly(LabelId),

    #[error("Label {0} is not a simple shape")]
    NotASimpleShape(LabelId),

    #[error("Label {0} cannot be referred by a component")]
    NotReferable(LabelId),

    #[error("Component would make assembly {assembly} contain itself through {referred}")]
    ReferenceCycle { assembly: LabelId, referred: LabelId },

    #[error("Assembly nesting below {0} is too deep")]
    NestingTooDeep(LabelId),

    #[error("Mesh of {label} refers to vertex {index} out of {vertex_count}")]
    MeshIndexOutOfRange {
        label: LabelId,
        index: u32,
        vertex_count: usize,
    },
}

/// 外部几何文档
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapeDocument {
    /// 标签槽位，下标 = 标签号 - 1；`None` 表示已删除
    labels: Vec<Option<Label>>,
}

impl ShapeDocument {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, label: Label) -> LabelId {
        self.labels.push(Some(label));
        LabelId(self.labels.len() as u32)
    }

    /// 获取标签
    pub fn label(&self, id: LabelId) -> Option<&Label> {
        if id.is_null() {
            return None;
        }
        self.labels.get(id.0 as usize - 1)?.as_ref()
    }

    fn label_mut(&mut self, id: LabelId) -> Option<&mut Label> {
        if id.is_null() {
            return None;
        }
        self.labels.get_mut(id.0 as usize - 1)?.as_mut()
    }

    /// 标签是否存在
    pub fn contains(&self, id: LabelId) -> bool {
        self.label(id).is_some()
    }

    /// 存活标签数量
    pub fn len(&self) -> usize {
        self.labels.iter().filter(|l| l.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有存活标签（按创建顺序）
    pub fn labels(&self) -> impl Iterator<Item = (LabelId, &Label)> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|l| (LabelId(i as u32 + 1), l)))
    }

    /// 添加顶层装配
    pub fn add_assembly(&mut self, name: Option<String>) -> LabelId {
        self.push(Label {
            father: LabelId::NULL,
            name,
            kind: LabelKind::Assembly {
                components: Vec::new(),
            },
        })
    }

    /// 添加顶层简单形状（零件）
    pub fn add_part(
        &mut self,
        name: Option<String>,
        shape_type: ShapeType,
        mesh: Option<TriangleMesh>,
    ) -> LabelId {
        self.push(Label {
            father: LabelId::NULL,
            name,
            kind: LabelKind::Simple {
                shape_type,
                mesh,
                sub_shapes: Vec::new(),
            },
        })
    }

    /// 向装配追加组件，组件以 `location` 定位引用 `referred`
    pub fn add_component(
        &mut self,
        assembly: LabelId,
        referred: LabelId,
        location: Isometry3<f64>,
        name: Option<String>,
    ) -> Result<LabelId, ShapeError> {
        match self.label(assembly).map(|l| &l.kind) {
            Some(LabelKind::Assembly { .. }) => {}
            Some(_) => return Err(ShapeError::NotAnAssembly(assembly)),
            None => return Err(ShapeError::UnknownLabel(assembly)),
        }
        match self.label(referred) {
            Some(l) if l.father.is_null() => {}
            Some(_) => return Err(ShapeError::NotReferable(referred)),
            None => return Err(ShapeError::UnknownLabel(referred)),
        }
        if self.reaches(referred, assembly) {
            return Err(ShapeError::ReferenceCycle { assembly, referred });
        }

        let component = self.push(Label {
            father: assembly,
            name,
            kind: LabelKind::Reference { referred, location },
        });
        if let Some(Label {
            kind: LabelKind::Assembly { components },
            ..
        }) = self.label_mut(assembly)
        {
            components.push(component);
        }
        Ok(component)
    }

    /// 向简单形状追加子形状
    pub fn add_sub_shape(
        &mut self,
        parent: LabelId,
        shape_type: ShapeType,
        name: Option<String>,
    ) -> Result<LabelId, ShapeError> {
        match self.label(parent).map(|l| &l.kind) {
            Some(LabelKind::Simple { .. }) => {}
            Some(_) => return Err(ShapeError::NotASimpleShape(parent)),
            None => return Err(ShapeError::UnknownLabel(parent)),
        }

        let sub = self.push(Label {
            father: parent,
            name,
            kind: LabelKind::SubShape { shape_type },
        });
        if let Some(Label {
            kind: LabelKind::Simple { sub_shapes, .. },
            ..
        }) = self.label_mut(parent)
        {
            sub_shapes.push(sub);
        }
        Ok(sub)
    }

    /// `from` 是否经由组件关系到达（或等于）`target`
    fn reaches(&self, from: LabelId, target: LabelId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for component in self.components(current) {
                stack.push(self.referred(*component));
            }
        }
        false
    }

    /// 自由形状：未被任何组件引用的顶层形状，按创建顺序
    pub fn free_shapes(&self) -> Vec<LabelId> {
        let referred: HashSet<LabelId> = self
            .labels()
            .filter_map(|(_, l)| match l.kind {
                LabelKind::Reference { referred, .. } => Some(referred),
                _ => None,
            })
            .collect();

        self.labels()
            .filter(|(id, l)| {
                l.father.is_null()
                    && matches!(l.kind, LabelKind::Assembly { .. } | LabelKind::Simple { .. })
                    && !referred.contains(id)
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_assembly(&self, id: LabelId) -> bool {
        matches!(self.label(id).map(|l| &l.kind), Some(LabelKind::Assembly { .. }))
    }

    pub fn is_simple(&self, id: LabelId) -> bool {
        matches!(self.label(id).map(|l| &l.kind), Some(LabelKind::Simple { .. }))
    }

    pub fn is_reference(&self, id: LabelId) -> bool {
        matches!(self.label(id).map(|l| &l.kind), Some(LabelKind::Reference { .. }))
    }

    pub fn is_sub_shape(&self, id: LabelId) -> bool {
        matches!(self.label(id).map(|l| &l.kind), Some(LabelKind::SubShape { .. }))
    }

    /// 装配的组件；非装配返回空
    pub fn components(&self, id: LabelId) -> &[LabelId] {
        match self.label(id).map(|l| &l.kind) {
            Some(LabelKind::Assembly { components }) => components,
            _ => &[],
        }
    }

    /// 简单形状的子形状；其他返回空
    pub fn sub_shapes(&self, id: LabelId) -> &[LabelId] {
        match self.label(id).map(|l| &l.kind) {
            Some(LabelKind::Simple { sub_shapes, .. }) => sub_shapes,
            _ => &[],
        }
    }

    /// 参照所引用的形状；非参照返回空标签
    pub fn referred(&self, id: LabelId) -> LabelId {
        match self.label(id).map(|l| &l.kind) {
            Some(LabelKind::Reference { referred, .. }) => *referred,
            _ => LabelId::NULL,
        }
    }

    /// 参照的定位；非参照为单位变换
    pub fn location(&self, id: LabelId) -> Isometry3<f64> {
        match self.label(id).map(|l| &l.kind) {
            Some(LabelKind::Reference { location, .. }) => *location,
            _ => Isometry3::identity(),
        }
    }

    /// 简单形状的网格
    pub fn mesh(&self, id: LabelId) -> Option<&TriangleMesh> {
        match self.label(id).map(|l| &l.kind) {
            Some(LabelKind::Simple { mesh, .. }) => mesh.as_ref(),
            _ => None,
        }
    }

    /// 拓扑类型；参照取被引用形状的类型
    pub fn shape_type(&self, id: LabelId) -> Option<ShapeType> {
        match &self.label(id)?.kind {
            LabelKind::Assembly { .. } => Some(ShapeType::Compound),
            LabelKind::Simple { shape_type, .. } | LabelKind::SubShape { shape_type } => {
                Some(*shape_type)
            }
            LabelKind::Reference { referred, .. } => self.shape_type(*referred),
        }
    }

    /// 设置简单形状的网格
    pub fn set_mesh(&mut self, id: LabelId, new_mesh: TriangleMesh) -> Result<(), ShapeError> {
        match self.label_mut(id).map(|l| &mut l.kind) {
            Some(LabelKind::Simple { mesh, .. }) => {
                *mesh = Some(new_mesh);
                Ok(())
            }
            Some(_) => Err(ShapeError::NotASimpleShape(id)),
            None => Err(ShapeError::UnknownLabel(id)),
        }
    }

    /// 名称属性
    pub fn name(&self, id: LabelId) -> Option<&str> {
        self.label(id)?.name.as_deref()
    }

    /// 设置名称属性
    pub fn set_name(&mut self, id: LabelId, name: impl Into<String>) {
        if let Some(label) = self.label_mut(id) {
            label.name = Some(name.into());
        }
    }

    /// 显示名称：名称属性优先，否则 "类型 标签号"，无形状时 "[[标签号]]"
    pub fn find_label_name(&self, id: LabelId) -> String {
        if let Some(name) = self.name(id).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match self.shape_type(id) {
            Some(shape_type) => format!("{} {}", shape_type.name(), id.0),
            None => format!("[[{}]]", id.0),
        }
    }

    /// 删除标签及其拥有的组件/子形状，以及引用它的组件
    ///
    /// 返回是否有标签被删除。
    pub fn remove_label(&mut self, id: LabelId) -> bool {
        let Some(label) = self.label(id).cloned() else {
            return false;
        };

        // 从所属标签的列表中摘除
        if let Some(father) = self.label_mut(label.father) {
            match &mut father.kind {
                LabelKind::Assembly { components } => components.retain(|c| *c != id),
                LabelKind::Simple { sub_shapes, .. } => sub_shapes.retain(|s| *s != id),
                _ => {}
            }
        }

        let owned: Vec<LabelId> = match &label.kind {
            LabelKind::Assembly { components } => components.clone(),
            LabelKind::Simple { sub_shapes, .. } => sub_shapes.clone(),
            _ => Vec::new(),
        };
        self.labels[id.0 as usize - 1] = None;
        for child in owned {
            self.remove_label(child);
        }

        // 引用已删除形状的组件随之删除
        let dangling: Vec<LabelId> = self
            .labels()
            .filter(|(_, l)| matches!(l.kind, LabelKind::Reference { referred, .. } if referred == id))
            .map(|(component, _)| component)
            .collect();
        for component in dangling {
            self.remove_label(component);
        }

        true
    }

    /// 删除顶层形状，并删除因此不再被引用的形状
    ///
    /// 删除前已是自由形状的其他标签保持不变。
    pub fn remove_shape_tree(&mut self, id: LabelId) -> bool {
        let free_before: std::collections::HashSet<LabelId> =
            self.free_shapes().into_iter().collect();
        if !self.remove_label(id) {
            return false;
        }
        loop {
            let orphans: Vec<LabelId> = self
                .free_shapes()
                .into_iter()
                .filter(|l| !free_before.contains(l))
                .collect();
            if orphans.is_empty() {
                break;
            }
            for orphan in orphans {
                self.remove_label(orphan);
            }
        }
        true
    }

    /// 将另一文档中的形状深拷贝为本文档的顶层形状，返回新标签
    ///
    /// 参照被拷贝为其引用的形状；子形状被拷贝为同类型的简单形状。
    /// 同一次拷贝中被多处引用的形状只拷贝一次。
    pub fn copy_shape_from(&mut self, source: &ShapeDocument, label: LabelId) -> Option<LabelId> {
        let mut copied = HashMap::new();
        self.copy_shape_memo(source, label, &mut copied)
    }

    /// 按顺序拷贝多个形状，彼此共享的形状只拷贝一次
    pub fn copy_shapes_from(&mut self, source: &ShapeDocument, labels: &[LabelId]) -> Vec<LabelId> {
        let mut copied = HashMap::new();
        labels
            .iter()
            .filter_map(|label| self.copy_shape_memo(source, *label, &mut copied))
            .collect()
    }

    fn copy_shape_memo(
        &mut self,
        source: &ShapeDocument,
        label: LabelId,
        copied: &mut HashMap<LabelId, LabelId>,
    ) -> Option<LabelId> {
        if let Some(done) = copied.get(&label) {
            // 空标签表示正在拷贝中，即遇到了环
            return (!done.is_null()).then_some(*done);
        }
        copied.insert(label, LabelId::NULL);
        let src = source.label(label)?;
        let name = src.name.clone();

        let new_label = match &src.kind {
            LabelKind::Assembly { components } => {
                let assembly = self.add_assembly(name);
                for component in components {
                    let referred = source.referred(*component);
                    let Some(target) = self.copy_shape_memo(source, referred, copied) else {
                        continue;
                    };
                    let component_name = source.label(*component).and_then(|l| l.name.clone());
                    // 源文档无环，拷贝结果同样无环
                    self.add_component(assembly, target, source.location(*component), component_name)
                        .ok()?;
                }
                assembly
            }
            LabelKind::Simple {
                shape_type,
                mesh,
                sub_shapes,
            } => {
                let part = self.add_part(name, *shape_type, mesh.clone());
                for sub in sub_shapes {
                    let Some(sub_label) = source.label(*sub) else {
                        continue;
                    };
                    if let LabelKind::SubShape { shape_type } = sub_label.kind {
                        self.add_sub_shape(part, shape_type, sub_label.name.clone())
                            .ok()?;
                    }
                }
                part
            }
            LabelKind::Reference { referred, .. } => {
                return self.copy_shape_memo(source, *referred, copied);
            }
            LabelKind::SubShape { shape_type } => self.add_part(name, *shape_type, None),
        };

        copied.insert(label, new_label);
        Some(new_label)
    }

    /// 检查文档结构的一致性
    ///
    /// 用于校验从外部数据反序列化得到的文档：所属关系、列表内容、引用目标和无环性。
    pub fn validate(&self) -> Result<(), ShapeError> {
        for (id, label) in self.labels() {
            if !label.father.is_null() {
                let listed = match self.label(label.father).map(|f| &f.kind) {
                    Some(LabelKind::Assembly { components }) => {
                        matches!(label.kind, LabelKind::Reference { .. }) && components.contains(&id)
                    }
                    Some(LabelKind::Simple { sub_shapes, .. }) => {
                        matches!(label.kind, LabelKind::SubShape { .. }) && sub_shapes.contains(&id)
                    }
                    _ => false,
                };
                if !listed {
                    return Err(ShapeError::NotReferable(id));
                }
            }
            match &label.kind {
                LabelKind::Assembly { components } => {
                    for component in components {
                        if !self.is_reference(*component) || self.label(*component).map(|l| l.father) != Some(id) {
                            return Err(ShapeError::UnknownLabel(*component));
                        }
                    }
                }
                LabelKind::Simple { sub_shapes, mesh, .. } => {
                    for sub in sub_shapes {
                        if !self.is_sub_shape(*sub) || self.label(*sub).map(|l| l.father) != Some(id) {
                            return Err(ShapeError::UnknownLabel(*sub));
                        }
                    }
                    if let Some(mesh) = mesh {
                        let vertex_count = mesh.vertices.len();
                        let bad = mesh.triangles.iter().flatten().find(|i| **i as usize >= vertex_count);
                        if let Some(index) = bad {
                            return Err(ShapeError::MeshIndexOutOfRange {
                                label: id,
                                index: *index,
                                vertex_count,
                            });
                        }
                    }
                }
                LabelKind::Reference { referred, .. } => match self.label(*referred) {
                    Some(target)
                        if target.father.is_null()
                            && matches!(target.kind, LabelKind::Assembly { .. } | LabelKind::Simple { .. }) => {}
                    Some(_) => return Err(ShapeError::NotReferable(*referred)),
                    None => return Err(ShapeError::UnknownLabel(*referred)),
                },
                LabelKind::SubShape { .. } => {
                    if label.father.is_null() {
                        return Err(ShapeError::NotASimpleShape(id));
                    }
                }
            }
        }

        self.check_nesting()
    }

    /// 装配嵌套无环，且层数不超过 `MAX_NESTING_DEPTH`
    ///
    /// 按"被引用形状先于引用它的装配"的拓扑序逐层计算，未能排序的装配位于环上或环之上。
    fn check_nesting(&self) -> Result<(), ShapeError> {
        let mut pending: HashMap<LabelId, usize> = HashMap::new();
        let mut users: HashMap<LabelId, Vec<LabelId>> = HashMap::new();
        let mut depth: HashMap<LabelId, usize> = HashMap::new();
        let mut ready = Vec::new();
        for (id, label) in self.labels() {
            match &label.kind {
                LabelKind::Assembly { components } => {
                    pending.insert(id, components.len());
                    for component in components {
                        users.entry(self.referred(*component)).or_default().push(id);
                    }
                    if components.is_empty() {
                        ready.push(id);
                    }
                }
                LabelKind::Simple { .. } if label.father.is_null() => ready.push(id),
                _ => {}
            }
        }

        while let Some(id) = ready.pop() {
            let level = depth.get(&id).copied().unwrap_or(0);
            if level > MAX_NESTING_DEPTH {
                return Err(ShapeError::NestingTooDeep(id));
            }
            for user in users.get(&id).into_iter().flatten() {
                let user_level = depth.entry(*user).or_insert(0);
                *user_level = (*user_level).max(level + 1);
                if let Some(remaining) = pending.get_mut(user) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        ready.push(*user);
                    }
                }
            }
        }

        let stuck = |id: &LabelId| pending.get(id).is_some_and(|n| *n > 0);
        let Some(mut current) = self.labels().map(|(id, _)| id).find(|id| stuck(id)) else {
            return Ok(());
        };
        // 沿未排序的组件前进，第一次回到走过的装配时它必在环上
        let mut walked = HashSet::new();
        loop {
            let next = self
                .components(current)
                .iter()
                .map(|c| self.referred(*c))
                .find(|r| stuck(r))
                .unwrap_or(current);
            if !walked.insert(current) {
                return Err(ShapeError::ReferenceCycle {
                    assembly: current,
                    referred: next,
                });
            }
            current = next;
        }
    }

    /// 收集形状下所有网格，变换到 `location` 所在坐标系后合并输出
    pub fn collect_meshes(
        &self,
        label: LabelId,
        location: &Isometry3<f64>,
        out: &mut Vec<(LabelId, TriangleMesh)>,
    ) {
        match self.label(label).map(|l| &l.kind) {
            Some(LabelKind::Assembly { components }) => {
                for component in components {
                    self.collect_meshes(*component, location, out);
                }
            }
            Some(LabelKind::Reference { referred, location: local }) => {
                self.collect_meshes(*referred, &(location * local), out);
            }
            Some(LabelKind::Simple { mesh: Some(mesh), .. }) => {
                out.push((label, mesh.transformed(location)));
            }
            _ => {}
        }
    }
}
