//! 3D幾何: レイ（半直線）表現、2本のレイの最近点、位置クラスタリング。

use nalgebra::{Matrix3, Point3, Vector3};

use crate::error::GeometryError;

/// 最近点候補を採用する残差距離の既定閾値
pub const DEFAULT_TOLERANCE1: f64 = 0.15;
/// 2つの候補点を同一人物とみなす距離の既定閾値
pub const DEFAULT_TOLERANCE2: f64 = 0.25;

/// 方向ベクトルの平行判定に使う閾値
const PARALLEL_EPS: f64 = 1e-10;

/// 原点と方向ベクトルで表すレイ。構築後は不変。
#[derive(Debug, Clone, PartialEq)]
pub struct Ray {
    pub origin: Point3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    pub fn new(origin: Point3<f64>, direction: Vector3<f64>) -> Self {
        Self { origin, direction }
    }

    /// パラメータ λ に対応する点 p = origin + λ·direction
    pub fn point_at(&self, lambda: f64) -> Point3<f64> {
        self.origin + lambda * self.direction
    }

    /// z 座標が `z` となる点。方向の z 成分がゼロならエラー。
    pub fn point_at_z(&self, z: f64) -> Result<Point3<f64>, GeometryError> {
        if self.direction.z.abs() < PARALLEL_EPS {
            return Err(GeometryError::NoIntersection);
        }
        let lambda = (z - self.origin.z) / self.direction.z;
        Ok(self.point_at(lambda))
    }
}

/// 2本のレイの最近接点。
///
/// 方向ベクトル t1, -t2 とその外積を列に持つ 3×3 連立方程式を解き、
/// それぞれのレイ上の最近点の中点と、最近点同士の距離の半分（残差）を返す。
/// 平行なレイには一意解が無いので `DegenerateRays` を返す。呼び出し側は
/// 捕捉してその候補をスキップする。
pub fn nearest_point(a: &Ray, b: &Ray) -> Result<(Point3<f64>, f64), GeometryError> {
    let cross = a.direction.cross(&b.direction);
    if cross.norm() < PARALLEL_EPS * a.direction.norm() * b.direction.norm() {
        return Err(GeometryError::DegenerateRays);
    }

    // λ1·t1 - λ2·t2 + μ·(t1×t2) = b.origin - a.origin
    let m = Matrix3::from_columns(&[a.direction, -b.direction, cross]);
    let rhs = b.origin - a.origin;
    let sol = m.lu().solve(&rhs).ok_or(GeometryError::DegenerateRays)?;

    let p1 = a.point_at(sol.x);
    let p2 = b.point_at(sol.y);
    let mid = Point3::from((p1.coords + p2.coords) / 2.0);
    Ok((mid, (p1 - p2).norm() / 2.0))
}

/// 複数カメラのレイから3D位置推定を計算する。
///
/// - `origins`: カメラごとのレイ始点（カメラ位置）
/// - `directions`: カメラごとの方向ベクトル列（検出1件につき1本）
///
/// すべてのカメラ対・レイ対について最近点候補を求め、残差が
/// `tolerance1` 未満のものだけ保持する。候補は最初のメンバーとの距離が
/// `tolerance2` 未満なら既存クラスタに合流し、それ以外は新クラスタを
/// 作る。カメラが3台以上なら真の点は複数のカメラ対から裏付けられるため、
/// 2候補以上のクラスタの重心のみを返す（単独候補はノイズ扱い）。
/// カメラ2台ではカメラ対がひとつしかなく裏付けが原理的に不可能なので、
/// 残差フィルタを通った候補をそのまま採用する。
pub fn calc_position(
    origins: &[Point3<f64>],
    directions: &[Vec<Vector3<f64>>],
    tolerance1: f64,
    tolerance2: f64,
) -> Vec<Point3<f64>> {
    debug_assert_eq!(origins.len(), directions.len());
    let rays: Vec<Vec<Ray>> = origins
        .iter()
        .zip(directions)
        .map(|(o, dirs)| dirs.iter().map(|d| Ray::new(*o, *d)).collect())
        .collect();

    let mut candidates: Vec<Point3<f64>> = Vec::new();
    for i in 0..rays.len() {
        for j in (i + 1)..rays.len() {
            for r1 in &rays[i] {
                for r2 in &rays[j] {
                    match nearest_point(r1, r2) {
                        Ok((p, residual)) if residual < tolerance1 => candidates.push(p),
                        Ok(_) => {}
                        Err(e) => log::debug!("skipping ray pair: {e}"),
                    }
                }
            }
        }
    }

    let mut clusters: Vec<Vec<Point3<f64>>> = Vec::new();
    'next: for p in candidates {
        for cluster in clusters.iter_mut() {
            if (p - cluster[0]).norm() < tolerance2 {
                cluster.push(p);
                continue 'next;
            }
        }
        clusters.push(vec![p]);
    }

    let min_members = if origins.len() > 2 { 2 } else { 1 };
    clusters
        .into_iter()
        .filter(|c| c.len() >= min_members)
        .map(|c| {
            let sum: Vector3<f64> = c.iter().map(|p| p.coords).sum();
            Point3::from(sum / c.len() as f64)
        })
        .collect()
}
