//! フレーム＝1枚の画像とプロパティバッグの組。
//!
//! プロパティバッグは型付きの名前/値ペアの順序付き集合で、`camera_id` を
//! 必ず含む。ワイヤ表現は `protocol` モジュール側で定義する。

use std::fmt;

/// プロパティの値（ワイヤ型: str / int / float）
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl PropValue {
    /// ワイヤ上の型名
    pub fn type_name(&self) -> &'static str {
        match self {
            PropValue::Str(_) => "str",
            PropValue::Int(_) => "int",
            PropValue::Float(_) => "float",
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Str(s) => write!(f, "{s}"),
            PropValue::Int(i) => write!(f, "{i}"),
            PropValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// 順序を保持するプロパティ集合。同名プロパティは後勝ち。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    entries: Vec<(String, PropValue)>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: PropValue) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(PropValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(PropValue::Float(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, PropValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// デコード済みの画像バッファ (height × width × channels, 行優先)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

impl ImageData {
    pub fn new(width: u32, height: u32, channels: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * channels) as usize);
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    /// アルファ付き (BGRA/RGBA) なら4チャンネル目を落とした複製を返す
    pub fn drop_alpha(&self) -> ImageData {
        if self.channels != 4 {
            return self.clone();
        }
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for px in self.data.chunks_exact(4) {
            data.extend_from_slice(&px[..3]);
        }
        ImageData::new(self.width, self.height, 3, data)
    }
}

/// 受信済みの1フレーム。ディスパッチ前に完全な状態で届く。
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: ImageData,
    pub props: PropertyBag,
}

impl Frame {
    pub fn new(image: ImageData, props: PropertyBag) -> Self {
        Self { image, props }
    }

    /// `camera_id` プロパティ（int か str、どちらでも可）
    pub fn camera_id(&self) -> Option<String> {
        match self.props.get("camera_id") {
            Some(PropValue::Str(s)) => Some(s.clone()),
            Some(PropValue::Int(i)) => Some(i.to_string()),
            Some(PropValue::Float(_)) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_bag_order_and_overwrite() {
        let mut bag = PropertyBag::new();
        bag.insert("a", PropValue::Str("x".into()));
        bag.insert("b", PropValue::Int(5));
        bag.insert("a", PropValue::Str("y".into()));

        // 挿入順は保持され、再挿入は上書きになる
        let names: Vec<&str> = bag.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(bag.get_str("a"), Some("y"));
        assert_eq!(bag.get_int("b"), Some(5));
        assert_eq!(bag.get_int("a"), None);
    }

    #[test]
    fn test_camera_id_accepts_int_or_str() {
        let img = ImageData::new(1, 1, 3, vec![0, 0, 0]);
        let mut props = PropertyBag::new();
        props.insert("camera_id", PropValue::Int(2));
        assert_eq!(Frame::new(img.clone(), props).camera_id().as_deref(), Some("2"));

        let mut props = PropertyBag::new();
        props.insert("camera_id", PropValue::Str("cam0".into()));
        assert_eq!(Frame::new(img, props).camera_id().as_deref(), Some("cam0"));
    }

    #[test]
    fn test_drop_alpha() {
        let img = ImageData::new(2, 1, 4, vec![1, 2, 3, 255, 4, 5, 6, 255]);
        let rgb = img.drop_alpha();
        assert_eq!(rgb.channels, 3);
        assert_eq!(rgb.data, vec![1, 2, 3, 4, 5, 6]);
    }
}
