//! 句柄索引的层次树
//!
//! 节点存放在连续的只追加数组中，通过 `TreeNodeId` 整数句柄互相引用，
//! 不存在指针环。句柄 `0` 保留为"无节点"（无父节点、无兄弟、空树）。
//!
//! 当前版本不支持删除节点：`remove` 会直接 panic。若将来实现删除，
//! 应为每个槽位增加代数（generation）以识别过期句柄，而不是复用原始索引。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 树节点句柄
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TreeNodeId(pub u32);

impl TreeNodeId {
    /// 空句柄
    pub const NULL: TreeNodeId = TreeNodeId(0);

    /// 检查是否为空句柄
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TreeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct TreeNode<T> {
    sibling_previous: TreeNodeId,
    sibling_next: TreeNodeId,
    child_first: TreeNodeId,
    child_last: TreeNodeId,
    parent: TreeNodeId,
    data: T,
}

/// 只追加的层次树
///
/// 不变式：
/// - 非根节点恰好出现在其父节点的子链中一次
/// - 兄弟链是合法的双向链表，从 `child_first` 走到 `child_last` 后以空句柄结束
/// - 当且仅当 `parent` 为空时节点是根，`roots()` 按追加顺序返回；根节点没有兄弟链接
/// - 已分配的句柄在树的生命周期内不会被重新编号（`clear` 除外）
#[derive(Debug, Clone)]
pub struct IndexedTree<T> {
    nodes: Vec<TreeNode<T>>,
    roots: Vec<TreeNodeId>,
    /// 未知句柄时 `node_data` 返回的默认值
    null_data: T,
}

impl<T: Default> IndexedTree<T> {
    /// 创建空树
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            null_data: T::default(),
        }
    }
}

impl<T: Default> Default for IndexedTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexedTree<T> {
    fn node(&self, id: TreeNodeId) -> Option<&TreeNode<T>> {
        if id.is_null() {
            return None;
        }
        self.nodes.get(id.0 as usize - 1)
    }

    fn node_mut(&mut self, id: TreeNodeId) -> Option<&mut TreeNode<T>> {
        if id.is_null() {
            return None;
        }
        self.nodes.get_mut(id.0 as usize - 1)
    }

    /// 前一个兄弟节点
    pub fn node_sibling_previous(&self, id: TreeNodeId) -> TreeNodeId {
        self.node(id).map_or(TreeNodeId::NULL, |n| n.sibling_previous)
    }

    /// 后一个兄弟节点
    pub fn node_sibling_next(&self, id: TreeNodeId) -> TreeNodeId {
        self.node(id).map_or(TreeNodeId::NULL, |n| n.sibling_next)
    }

    /// 第一个子节点
    pub fn node_child_first(&self, id: TreeNodeId) -> TreeNodeId {
        self.node(id).map_or(TreeNodeId::NULL, |n| n.child_first)
    }

    /// 最后一个子节点
    pub fn node_child_last(&self, id: TreeNodeId) -> TreeNodeId {
        self.node(id).map_or(TreeNodeId::NULL, |n| n.child_last)
    }

    /// 父节点
    pub fn node_parent(&self, id: TreeNodeId) -> TreeNodeId {
        self.node(id).map_or(TreeNodeId::NULL, |n| n.parent)
    }

    /// 节点数据；句柄未知时返回默认构造的值
    pub fn node_data(&self, id: TreeNodeId) -> &T {
        self.node(id).map_or(&self.null_data, |n| &n.data)
    }

    /// 是否为根节点；未知句柄返回 `false`
    pub fn node_is_root(&self, id: TreeNodeId) -> bool {
        self.node(id).is_some_and(|n| n.parent.is_null())
    }

    /// 句柄是否属于这棵树
    pub fn contains(&self, id: TreeNodeId) -> bool {
        self.node(id).is_some()
    }

    /// 按追加顺序排列的根节点
    pub fn roots(&self) -> &[TreeNodeId] {
        &self.roots
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 遍历直接子节点
    pub fn children(&self, id: TreeNodeId) -> Children<'_, T> {
        Children {
            tree: self,
            next: self.node_child_first(id),
        }
    }

    /// 清空所有节点，之前分配的句柄全部失效
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    /// 追加节点作为 `parent` 的最后一个子节点；`parent` 为空时追加为新的根
    ///
    /// # Panics
    ///
    /// `parent` 非空但不属于这棵树时 panic。
    pub fn append_child(&mut self, parent: TreeNodeId, data: T) -> TreeNodeId {
        if !parent.is_null() && !self.contains(parent) {
            panic!("IndexedTree::append_child: unknown parent node {parent}");
        }

        let id = match u32::try_from(self.nodes.len() + 1) {
            Ok(raw) => TreeNodeId(raw),
            Err(_) => panic!("IndexedTree::append_child: node handle space exhausted"),
        };

        // 根节点之间不互相链接，只记录在 `roots` 中
        let sibling_previous = self.node_child_last(parent);

        self.nodes.push(TreeNode {
            sibling_previous,
            sibling_next: TreeNodeId::NULL,
            child_first: TreeNodeId::NULL,
            child_last: TreeNodeId::NULL,
            parent,
            data,
        });

        if let Some(previous) = self.node_mut(sibling_previous) {
            previous.sibling_next = id;
        }

        if let Some(parent_node) = self.node_mut(parent) {
            if parent_node.child_first.is_null() {
                parent_node.child_first = id;
            }
            parent_node.child_last = id;
        } else {
            self.roots.push(id);
        }

        id
    }

    /// 删除节点
    ///
    /// 尚未实现：只追加的存储无法在不重新编号的前提下回收槽位。
    /// 需要删除时请修改底层文档后调用重建。
    pub fn remove(&mut self, id: TreeNodeId) {
        unimplemented!("IndexedTree::remove({id}): node removal is not supported, rebuild the tree instead")
    }
}

/// 子节点迭代器
pub struct Children<'a, T> {
    tree: &'a IndexedTree<T>,
    next: TreeNodeId,
}

impl<T> Iterator for Children<'_, T> {
    type Item = TreeNodeId;

    fn next(&mut self) -> Option<TreeNodeId> {
        if self.next.is_null() {
            return None;
        }
        let current = self.next;
        self.next = self.tree.node_sibling_next(current);
        Some(current)
    }
}

/// 深度优先前序遍历整棵树（所有根，子节点先于后续兄弟）
///
/// 遍历只依赖句柄链接，不记录已访问集合；对违反不变式（含环）的树行为未定义。
pub fn deep_foreach_tree_node<T, F>(tree: &IndexedTree<T>, mut visit: F)
where
    F: FnMut(TreeNodeId),
{
    for &root in tree.roots() {
        deep_foreach_tree_node_from(root, tree, &mut visit);
    }
}

/// 从 `node` 开始深度优先前序遍历其子树
pub fn deep_foreach_tree_node_from<T, F>(node: TreeNodeId, tree: &IndexedTree<T>, visit: &mut F)
where
    F: FnMut(TreeNodeId),
{
    if !tree.contains(node) {
        return;
    }

    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        visit(current);
        // 逆序压栈，保证先访问第一个子节点
        let mut child = tree.node_child_last(current);
        while !child.is_null() {
            stack.push(child);
            child = tree.node_sibling_previous(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (IndexedTree<&'static str>, [TreeNodeId; 6]) {
        // a
        // ├─ b
        // │  └─ d
        // └─ c
        // e
        // └─ f
        let mut tree = IndexedTree::new();
        let a = tree.append_child(TreeNodeId::NULL, "a");
        let b = tree.append_child(a, "b");
        let c = tree.append_child(a, "c");
        let d = tree.append_child(b, "d");
        let e = tree.append_child(TreeNodeId::NULL, "e");
        let f = tree.append_child(e, "f");
        (tree, [a, b, c, d, e, f])
    }

    #[test]
    fn test_append_child_links() {
        let (tree, [a, b, c, d, e, f]) = sample_tree();

        assert_eq!(tree.len(), 6);
        assert_eq!(tree.roots(), &[a, e]);
        assert_eq!(tree.node_parent(b), a);
        assert_eq!(tree.node_parent(c), a);
        assert_eq!(tree.node_parent(d), b);
        assert_eq!(tree.node_parent(f), e);

        assert_eq!(tree.node_child_first(a), b);
        assert_eq!(tree.node_child_last(a), c);
        assert_eq!(tree.node_sibling_next(b), c);
        assert_eq!(tree.node_sibling_previous(c), b);
        assert!(tree.node_sibling_next(c).is_null());
        assert!(tree.node_sibling_previous(b).is_null());

        assert!(tree.node_is_root(a));
        assert!(tree.node_is_root(e));
        assert!(!tree.node_is_root(d));
        assert_eq!(*tree.node_data(d), "d");
    }

    #[test]
    fn test_append_is_last_among_siblings() {
        let mut tree = IndexedTree::new();
        let root = tree.append_child(TreeNodeId::NULL, 0);
        for value in 1..=5 {
            let id = tree.append_child(root, value);
            assert_eq!(tree.node_parent(id), root);
            assert_eq!(tree.node_child_last(root), id);
            assert_eq!(tree.children(root).filter(|&c| c == id).count(), 1);
        }
        let values: Vec<i32> = tree.children(root).map(|c| *tree.node_data(c)).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_roots_have_no_siblings() {
        let (tree, [a, _, _, _, e, _]) = sample_tree();
        for root in [a, e] {
            assert!(tree.node_sibling_next(root).is_null());
            assert!(tree.node_sibling_previous(root).is_null());
        }
        assert_eq!(tree.roots(), &[a, e]);
    }

    #[test]
    fn test_unknown_handles_return_sentinels() {
        let (tree, _) = sample_tree();
        for id in [TreeNodeId::NULL, TreeNodeId(7), TreeNodeId(u32::MAX)] {
            assert!(tree.node_parent(id).is_null());
            assert!(tree.node_child_first(id).is_null());
            assert!(tree.node_child_last(id).is_null());
            assert!(tree.node_sibling_previous(id).is_null());
            assert!(tree.node_sibling_next(id).is_null());
            assert!(!tree.node_is_root(id));
            assert_eq!(*tree.node_data(id), "");
        }
    }

    #[test]
    fn test_deep_foreach_visits_each_node_once_in_preorder() {
        let (tree, [a, b, c, d, e, f]) = sample_tree();
        let mut visited = Vec::new();
        deep_foreach_tree_node(&tree, |id| visited.push(id));
        assert_eq!(visited, vec![a, b, d, c, e, f]);
    }

    #[test]
    fn test_deep_foreach_parent_before_children() {
        let mut tree = IndexedTree::new();
        let mut handles = vec![tree.append_child(TreeNodeId::NULL, 0usize)];
        // 伪随机形状：每个新节点挂到已有节点 (i * 7) % n 上
        for i in 1..200usize {
            let parent = handles[(i * 7) % handles.len()];
            handles.push(tree.append_child(parent, i));
        }

        let mut order = Vec::new();
        deep_foreach_tree_node(&tree, |id| order.push(id));
        assert_eq!(order.len(), handles.len());

        let position = |id: TreeNodeId| order.iter().position(|&v| v == id).unwrap();
        for &id in &handles {
            let parent = tree.node_parent(id);
            if !parent.is_null() {
                assert!(position(parent) < position(id));
            }
            let previous = tree.node_sibling_previous(id);
            if !previous.is_null() {
                assert!(position(previous) < position(id));
            }
        }
    }

    #[test]
    fn test_clear() {
        let (mut tree, [a, ..]) = sample_tree();
        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.roots().is_empty());
        assert!(!tree.contains(a));

        let fresh = tree.append_child(TreeNodeId::NULL, "x");
        assert_eq!(fresh, TreeNodeId(1));
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn test_remove_panics() {
        let (mut tree, [a, ..]) = sample_tree();
        tree.remove(a);
    }

    #[test]
    #[should_panic(expected = "unknown parent")]
    fn test_append_to_unknown_parent_panics() {
        let mut tree: IndexedTree<u8> = IndexedTree::new();
        tree.append_child(TreeNodeId(3), 1);
    }
}
