//! ピンホールカメラモデル: 正規化ピクセル座標をワールド空間のレイへ写像する。

use nalgebra::{Point3, Vector3};

use crate::error::ConfigError;
use crate::geometry::Ray;

/// 前方軸と x 軸の直交チェックに使う閾値（正規化後の内積）
const ORTHO_EPS: f64 = 1e-4;

/// 固定設置カメラ。構築後は不変。
///
/// 画角は (垂直角 theta + 横縦比 whratio) か (theta + 水平角 phi) の
/// いずれかで与える。3パラメータのうち2つ以上が必須で、不足は設定エラー。
#[derive(Debug, Clone)]
pub struct Camera {
    position: Point3<f64>,
    /// 正規化済みの前方ベクトル（画素中心の向き）
    forward: Vector3<f64>,
    /// 正規化済みのカメラ x 軸
    axis_x: Vector3<f64>,
    /// forward × axis_x
    axis_y: Vector3<f64>,
    theta: Option<f64>,
    phi: Option<f64>,
    whratio: Option<f64>,
}

impl Camera {
    /// 角度はラジアン。forward ⟂ axis_x でなければ `AxesNotOrthogonal`、
    /// 画角パラメータが2つ未満なら `UnderconstrainedCamera`。
    pub fn new(
        position: Point3<f64>,
        forward: Vector3<f64>,
        axis_x: Vector3<f64>,
        theta: Option<f64>,
        phi: Option<f64>,
        whratio: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let provided = [theta.is_some(), phi.is_some(), whratio.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
        if provided < 2 {
            return Err(ConfigError::UnderconstrainedCamera);
        }

        let forward = forward.normalize();
        let axis_x = axis_x.normalize();
        let dot = forward.dot(&axis_x);
        if dot.abs() >= ORTHO_EPS {
            return Err(ConfigError::AxesNotOrthogonal { dot });
        }

        let axis_y = forward.cross(&axis_x);
        Ok(Self {
            position,
            forward,
            axis_x,
            axis_y,
            theta,
            phi,
            whratio,
        })
    }

    pub fn position(&self) -> Point3<f64> {
        self.position
    }

    /// 正規化ピクセル座標 (x, y) ∈ [0,1]² をワールド空間のレイへ写像する。
    ///
    /// 画像の y 軸は上下が反転しているため、(0.5 - y) のオフセットで
    /// ワールド座標系（右手系）に合わせる。中心画素 (0.5, 0.5) は
    /// ちょうど前方ベクトルに一致する。
    pub fn image_mapping(&self, x: f64, y: f64) -> Ray {
        let (extent_x, extent_y) = match (self.theta, self.phi, self.whratio) {
            (Some(theta), phi, whratio) => {
                let ey = (theta / 2.0).tan() * 2.0;
                let ex = match phi {
                    Some(phi) => (phi / 2.0).tan() * 2.0,
                    // whratio must exist: the constructor requires 2 of 3
                    None => ey * whratio.unwrap_or(1.0),
                };
                (ex, ey)
            }
            (None, Some(phi), whratio) => {
                let ex = (phi / 2.0).tan() * 2.0;
                (ex, ex / whratio.unwrap_or(1.0))
            }
            (None, None, _) => unreachable!("constructor requires two of theta/phi/whratio"),
        };

        let direction = self.forward
            + extent_x * (0.5 - x) * self.axis_x
            + extent_y * (0.5 - y) * self.axis_y;
        Ray::new(self.position, direction)
    }

    /// カメラ座標系の点をワールド座標へ変換する（基底変換＋平行移動）。
    pub fn world_mapping(&self, local: Point3<f64>) -> Point3<f64> {
        Point3::from(
            local.x * self.axis_x + local.y * self.axis_y + local.z * self.forward
                + self.position.coords,
        )
    }
}
