//! Registry of op factories.
//!
//! Maps the compile-time op id to a factory that builds the target side of
//! that op when a fresh message arrives. A duplicate id is treated as a
//! hash collision (or a double registration) and is fatal — silently
//! dispatching half the messages to the wrong op class would be far worse.

use std::collections::HashMap;
use std::sync::Mutex;

use nexus_common::error::{CommonError, CommonResult};

use crate::op::Op;

pub type OpFactory = Box<dyn Fn() -> Box<dyn Op> + Send + Sync>;

#[derive(Default)]
pub struct OpRegistry {
    known: Mutex<HashMap<u32, (String, OpFactory)>>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry { known: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, op_id: u32, op_name: &str, factory: OpFactory) -> CommonResult<()> {
        let mut g = self.known.lock().unwrap();
        if let Some((existing, _)) = g.get(&op_id) {
            return Err(CommonError::DuplicateComponent(format!(
                "op id {:#x} already bound to '{}' (registering '{}')",
                op_id, existing, op_name
            )));
        }
        g.insert(op_id, (op_name.to_string(), factory));
        Ok(())
    }

    pub fn deregister(&self, op_id: u32) {
        self.known.lock().unwrap().remove(&op_id);
    }

    /// Forget every op, releasing whatever the factories captured.
    pub fn clear(&self) {
        self.known.lock().unwrap().clear();
    }

    /// Build a new target op, or None when the id is unknown.
    pub fn create(&self, op_id: u32) -> Option<Box<dyn Op>> {
        let g = self.known.lock().unwrap();
        g.get(&op_id).map(|(_, f)| f())
    }

    pub fn known_ops(&self) -> Vec<(u32, String)> {
        let g = self.known.lock().unwrap();
        let mut v: Vec<(u32, String)> = g.iter().map(|(id, (n, _))| (*id, n.clone())).collect();
        v.sort_by_key(|(id, _)| *id);
        v
    }

    /// One-line-per-op listing for fatal diagnostics.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (id, name) in self.known_ops() {
            out.push_str(&format!("  {:#010x}  {}\n", id, name));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{OpArgs, WaitingType};

    struct NullOp;

    fn null_factory() -> Box<dyn Op> {
        Box::new(NullOp)
    }

    impl Op for NullOp {
        fn op_id(&self) -> u32 {
            0x1111
        }
        fn op_name(&self) -> &'static str {
            "NullOp"
        }
        fn update(&mut self, _args: &mut OpArgs) -> WaitingType {
            WaitingType::DoneAndDestroy
        }
    }

    #[test]
    fn test_register_create() {
        let r = OpRegistry::new();
        r.register(0x1111, "NullOp", Box::new(null_factory)).unwrap();
        assert!(r.create(0x1111).is_some());
        assert!(r.create(0x2222).is_none());
        assert_eq!(r.known_ops(), vec![(0x1111, "NullOp".to_string())]);
    }

    #[test]
    fn test_duplicate_id_refused() {
        let r = OpRegistry::new();
        r.register(0x1111, "NullOp", Box::new(null_factory)).unwrap();
        let err = r.register(0x1111, "Other", Box::new(null_factory));
        assert!(err.is_err());
    }

    #[test]
    fn test_deregister() {
        let r = OpRegistry::new();
        r.register(0x1111, "NullOp", Box::new(null_factory)).unwrap();
        r.deregister(0x1111);
        assert!(r.create(0x1111).is_none());
    }
}
