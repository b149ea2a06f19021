use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 信封在传输边界上的序列化形态：头映射 + 二进制载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
