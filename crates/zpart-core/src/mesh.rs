//! 三角网格
//!
//! 简单零件可以附带一个三角网格，STL 等网格格式直接读写它。

use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// 索引三角网格
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    /// 顶点
    pub vertices: Vec<Point3<f64>>,
    /// 三角形（顶点索引，逆时针）
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// 三角形数量
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// 追加一个独立三角形（不共享顶点）
    pub fn push_triangle(&mut self, a: Point3<f64>, b: Point3<f64>, c: Point3<f64>) {
        let base = self.vertices.len() as u32;
        self.vertices.extend([a, b, c]);
        self.triangles.push([base, base + 1, base + 2]);
    }

    /// 合并另一个网格
    pub fn append(&mut self, other: &TriangleMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.triangles.extend(
            other
                .triangles
                .iter()
                .map(|t| [t[0] + base, t[1] + base, t[2] + base]),
        );
    }

    /// 应用刚体变换后的副本
    pub fn transformed(&self, location: &Isometry3<f64>) -> TriangleMesh {
        TriangleMesh {
            vertices: self.vertices.iter().map(|v| location * v).collect(),
            triangles: self.triangles.clone(),
        }
    }

    /// 遍历三角形的三个顶点；索引越界的三角形被跳过
    pub fn facets(&self) -> impl Iterator<Item = [Point3<f64>; 3]> + '_ {
        self.triangles.iter().filter_map(|t| {
            let a = self.vertices.get(t[0] as usize)?;
            let b = self.vertices.get(t[1] as usize)?;
            let c = self.vertices.get(t[2] as usize)?;
            Some([*a, *b, *c])
        })
    }

    /// 轴向包围盒（最小点、最大点）
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?;
        let mut min = *first;
        let mut max = *first;
        for v in &self.vertices[1..] {
            min = min.inf(v);
            max = max.sup(v);
        }
        Some((min, max))
    }
}

/// 三角形单位法向；退化三角形返回零向量
pub fn facet_normal(facet: &[Point3<f64>; 3]) -> Vector3<f64> {
    let n = (facet[1] - facet[0]).cross(&(facet[2] - facet[0]));
    n.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::zeros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_offsets_indices() {
        let mut a = TriangleMesh::new();
        a.push_triangle(Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(0.0, 1.0, 0.0));
        let b = a.clone();
        a.append(&b);

        assert_eq!(a.triangle_count(), 2);
        assert_eq!(a.triangles[1], [3, 4, 5]);
        assert_eq!(a.facets().count(), 2);
    }

    #[test]
    fn test_transformed_and_bounds() {
        let mut mesh = TriangleMesh::new();
        mesh.push_triangle(Point3::origin(), Point3::new(2.0, 0.0, 0.0), Point3::new(0.0, 3.0, 0.0));
        let moved = mesh.transformed(&Isometry3::translation(0.0, 0.0, 5.0));

        let (min, max) = moved.bounds().unwrap();
        assert_eq!(min, Point3::new(0.0, 0.0, 5.0));
        assert_eq!(max, Point3::new(2.0, 3.0, 5.0));

        let normal = facet_normal(&moved.facets().next().unwrap());
        assert!((normal - Vector3::z()).norm() < 1e-12);
    }
}
