//! The host object graph and reflective dispatch.
//!
//! The foreign modules observe the host through `syscall/js` reflection:
//! property gets and sets, method calls, constructors. This module seeds
//! the objects those binaries look up at startup (`fs`, `process`,
//! `crypto`, `Date`, the typed-array constructors, `_pendingEvent`,
//! `_makeFuncWrapper`) and routes `fs.*`/`process.*` calls onto the typed
//! [`FsOps`] surface, delivering results through the guest's callback
//! protocol.

use goscript_vfs::{FileStat, FsOps, VfsError};
use rand::RngCore;

use crate::values::{JsRef, Value, ValueHeap, ID_GLOBAL, ID_THIS};

/// Outcome of a reflective call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dispatch {
    /// The call returned a plain value.
    Value(JsRef),
    /// The call completed by handing `args` to a guest callback; `ret` is
    /// the call's own return value. The ABI layer queues the event and
    /// re-enters the guest's `resume` export before storing `ret`.
    Callback {
        func: u32,
        args: Vec<JsRef>,
        ret: JsRef,
    },
    /// The call threw.
    Error(JsRef),
}

#[derive(Debug)]
pub(crate) struct JsHost {
    pub(crate) heap: ValueHeap,
    pub(crate) fs: FsOps,
}

impl JsHost {
    pub(crate) fn new(fs: FsOps) -> Self {
        let mut host = Self {
            heap: ValueHeap::new(),
            fs,
        };
        host.seed();
        host
    }

    /// Populate the global and `this` objects with everything the foreign
    /// binaries expect to find.
    fn seed(&mut self) {
        let fs = self.add_object(ID_GLOBAL, "fs");
        for method in [
            "writeSync",
            "write",
            "open",
            "read",
            "close",
            "stat",
            "lstat",
            "fstat",
            "mkdir",
            "readdir",
            "unlink",
            "rename",
            "rmdir",
            "fsync",
        ] {
            self.add_method(fs, method);
        }

        // The numeric values are part of the contract with the foreign
        // binaries and must match these bytes exactly.
        let constants = self.add_object(fs, "constants");
        for (name, value) in [
            ("O_WRONLY", 1.0),
            ("O_RDWR", 2.0),
            ("O_CREAT", 64.0),
            ("O_TRUNC", 512.0),
            ("O_APPEND", 1024.0),
            ("O_EXCL", 128.0),
            ("O_DIRECTORY", 65536.0),
        ] {
            self.heap.set_prop(constants, name, JsRef::Number(value));
        }

        let process = self.add_object(ID_GLOBAL, "process");
        for method in ["cwd", "chdir", "getuid", "getgid", "geteuid", "getegid", "umask"] {
            self.add_method(process, method);
        }
        self.heap.set_prop(process, "pid", JsRef::Number(1.0));
        self.heap.set_prop(process, "ppid", JsRef::Number(0.0));

        let crypto = self.add_object(ID_GLOBAL, "crypto");
        self.add_method(crypto, "getRandomValues");

        let date = self.alloc_method_object("Date");
        self.heap.set_prop(ID_GLOBAL, "Date", JsRef::Id(date));
        self.add_method(date, "getTimezoneOffset");

        for ctor in [
            "Object",
            "Array",
            "Uint8Array",
            "Int8Array",
            "Uint16Array",
            "Int16Array",
            "Uint32Array",
            "Int32Array",
            "Float32Array",
            "Float64Array",
        ] {
            let id = self.alloc_method_object(ctor);
            self.heap.set_prop(ID_GLOBAL, ctor, JsRef::Id(id));
        }

        self.heap.set_prop(ID_THIS, "_pendingEvent", JsRef::Null);
        self.add_method(ID_THIS, "_makeFuncWrapper");
    }

    fn alloc_method_object(&mut self, name: &str) -> u32 {
        self.heap.alloc(Value::method(name))
    }

    fn add_object(&mut self, parent: u32, name: &str) -> u32 {
        let id = self.heap.alloc(Value::object(name));
        self.heap.set_prop(parent, name, JsRef::Id(id));
        id
    }

    fn add_method(&mut self, parent: u32, name: &str) -> u32 {
        let id = self.alloc_method_object(name);
        self.heap.set_prop(parent, name, JsRef::Id(id));
        id
    }

    pub(crate) fn string_ref(&mut self, s: impl Into<String>) -> JsRef {
        JsRef::Id(self.heap.alloc(Value::String(s.into())))
    }

    /// The text of a string value.
    pub(crate) fn js_string(&self, r: JsRef) -> Option<String> {
        match self.heap.get(r.as_id()?)? {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// String coercion, as `valuePrepareString` applies to its argument.
    pub(crate) fn stringify(&self, r: JsRef) -> String {
        match r {
            JsRef::Undefined => "undefined".to_string(),
            JsRef::Null => "null".to_string(),
            JsRef::Bool(b) => b.to_string(),
            JsRef::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{n}")
                }
            }
            JsRef::Id(id) => match self.heap.get(id) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object { name, .. }) => format!("[object {name}]"),
                Some(Value::Bytes(_)) => "[object Uint8Array]".to_string(),
                Some(Value::Array(_)) => "[object Array]".to_string(),
                _ => "undefined".to_string(),
            },
        }
    }

    /// An error object carrying the errno name the guest matches on.
    pub(crate) fn error_ref(&mut self, err: VfsError) -> JsRef {
        let code = self.string_ref(err.code());
        let message = self.string_ref(err.to_string());
        let id = self.heap.alloc(Value::object("Error"));
        self.heap.set_prop(id, "code", code);
        self.heap.set_prop(id, "message", message);
        JsRef::Id(id)
    }

    fn throw(&mut self, message: &str) -> Dispatch {
        let text = self.string_ref(message);
        let id = self.heap.alloc(Value::object("Error"));
        self.heap.set_prop(id, "message", text);
        Dispatch::Error(JsRef::Id(id))
    }

    // ---- reflection ----

    pub(crate) fn reflect_get(&mut self, target: JsRef, key: &str) -> JsRef {
        match target {
            JsRef::Id(id) => self
                .heap
                .props(id)
                .and_then(|props| props.get(key).copied())
                .unwrap_or(JsRef::Undefined),
            _ => JsRef::Undefined,
        }
    }

    pub(crate) fn reflect_set(&mut self, target: JsRef, key: &str, value: JsRef) {
        if let Some(id) = target.as_id() {
            self.heap.set_prop(id, key, value);
        }
    }

    pub(crate) fn reflect_delete(&mut self, target: JsRef, key: &str) {
        if let Some(id) = target.as_id() {
            self.heap.delete_prop(id, key);
        }
    }

    pub(crate) fn index(&self, target: JsRef, index: i64) -> JsRef {
        let Some(id) = target.as_id() else {
            return JsRef::Undefined;
        };
        match self.heap.get(id) {
            Some(Value::Array(items)) => {
                items.get(index as usize).copied().unwrap_or(JsRef::Undefined)
            }
            Some(Value::Bytes(bytes)) => bytes
                .get(index as usize)
                .map(|b| JsRef::Number(*b as f64))
                .unwrap_or(JsRef::Undefined),
            _ => JsRef::Undefined,
        }
    }

    pub(crate) fn set_index(&mut self, target: JsRef, index: i64, value: JsRef) {
        let Some(id) = target.as_id() else {
            return;
        };
        let index = index as usize;
        match self.heap.get_mut(id) {
            Some(Value::Array(items)) => {
                if items.len() <= index {
                    items.resize(index + 1, JsRef::Undefined);
                }
                items[index] = value;
            }
            Some(Value::Bytes(bytes)) => {
                if let (true, Some(n)) = (index < bytes.len(), value.as_number()) {
                    bytes[index] = n as u8;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn length(&self, target: JsRef) -> i64 {
        let Some(id) = target.as_id() else {
            return 0;
        };
        match self.heap.get(id) {
            Some(Value::Array(items)) => items.len() as i64,
            Some(Value::Bytes(bytes)) => bytes.len() as i64,
            Some(Value::String(s)) => s.chars().count() as i64,
            _ => 0,
        }
    }

    /// Structural `instanceof`: true when the value was constructed by the
    /// named constructor.
    pub(crate) fn instance_of(&self, value: JsRef, ctor: JsRef) -> bool {
        let (Some(v), Some(c)) = (value.as_id(), ctor.as_id()) else {
            return false;
        };
        match (self.heap.get(v), self.heap.object_name(c)) {
            (Some(Value::Bytes(_)), Some("Uint8Array")) => true,
            (Some(Value::Array(_)), Some("Array")) => true,
            (Some(Value::Object { name, .. }), Some(ctor_name)) => name == ctor_name,
            _ => false,
        }
    }

    pub(crate) fn construct(&mut self, target: JsRef, args: Vec<JsRef>) -> Dispatch {
        let Some(id) = target.as_id() else {
            return self.throw("construct on a non-object");
        };
        let name = match self.heap.object_name(id) {
            Some(n) => n.to_string(),
            None => return self.throw("construct on a non-object"),
        };
        match name.as_str() {
            "Uint8Array" | "Int8Array" | "Uint16Array" | "Int16Array" | "Uint32Array"
            | "Int32Array" | "Float32Array" | "Float64Array" => {
                let len = args
                    .first()
                    .and_then(JsRef::as_number)
                    .unwrap_or(0.0)
                    .max(0.0) as usize;
                Dispatch::Value(JsRef::Id(self.heap.alloc(Value::Bytes(vec![0; len]))))
            }
            "Array" => Dispatch::Value(JsRef::Id(self.heap.alloc(Value::Array(Vec::new())))),
            "Object" => Dispatch::Value(JsRef::Id(self.heap.alloc(Value::object("")))),
            // A date instance answers the same calls the class object does.
            "Date" => Dispatch::Value(JsRef::Id(id)),
            other => self.throw(&format!("{other} is not a constructor")),
        }
    }

    pub(crate) fn call(&mut self, target: JsRef, method: &str, args: Vec<JsRef>) -> Dispatch {
        let Some(id) = target.as_id() else {
            return self.throw("method call on a non-object");
        };
        let receiver = match self.heap.object_name(id) {
            Some(n) => n.to_string(),
            None => return self.throw("method call on a non-object"),
        };
        match receiver.as_str() {
            "fs" => self.call_fs(method, args),
            "process" => self.call_process(method, args),
            "crypto" if method == "getRandomValues" => self.get_random_values(args),
            "Date" if method == "getTimezoneOffset" => Dispatch::Value(JsRef::Number(0.0)),
            "Stats" => self.call_stats(id, method),
            "this" if method == "_makeFuncWrapper" => {
                let wrapper = self.alloc_method_object("wrappedFunc");
                let func_id = args.first().copied().unwrap_or(JsRef::Undefined);
                self.heap.set_prop(wrapper, "id", func_id);
                Dispatch::Value(JsRef::Id(wrapper))
            }
            _ => self.throw(&format!("{receiver}.{method} is not a function")),
        }
    }

    /// Direct invocation of a value. Only guest-created function wrappers
    /// are invokable.
    pub(crate) fn invoke(&mut self, target: JsRef, args: Vec<JsRef>) -> Dispatch {
        match target.as_id() {
            Some(id) if self.heap.object_name(id) == Some("wrappedFunc") => Dispatch::Callback {
                func: id,
                args,
                ret: JsRef::Undefined,
            },
            _ => self.throw("value is not a function"),
        }
    }

    /// Stage a callback event where the guest's `resume` handler looks for
    /// it: `this._pendingEvent = {id, this: func, args}`.
    pub(crate) fn queue_event(&mut self, func: u32, args: Vec<JsRef>) {
        let func_id = self
            .heap
            .props(func)
            .and_then(|props| props.get("id").copied())
            .unwrap_or(JsRef::Undefined);
        let args_id = self.heap.alloc(Value::Array(args));
        let event = self.heap.alloc(Value::object("event"));
        self.heap.set_prop(event, "id", func_id);
        self.heap.set_prop(event, "this", JsRef::Id(func));
        self.heap.set_prop(event, "args", JsRef::Id(args_id));
        self.heap.set_prop(ID_THIS, "_pendingEvent", JsRef::Id(event));
    }

    // ---- argument decoding ----

    fn arg(&self, args: &[JsRef], i: usize) -> JsRef {
        args.get(i).copied().unwrap_or(JsRef::Undefined)
    }

    fn arg_str(&self, args: &[JsRef], i: usize) -> Option<String> {
        self.js_string(self.arg(args, i))
    }

    fn arg_u32(&self, args: &[JsRef], i: usize) -> u32 {
        self.arg(args, i).as_number().unwrap_or(0.0) as u32
    }

    fn arg_usize(&self, args: &[JsRef], i: usize) -> usize {
        self.arg(args, i).as_number().unwrap_or(0.0).max(0.0) as usize
    }

    fn arg_pos(&self, args: &[JsRef], i: usize) -> Option<u64> {
        let arg = self.arg(args, i);
        if arg.is_nullish() {
            None
        } else {
            arg.as_number().map(|n| n.max(0.0) as u64)
        }
    }

    fn arg_callback(&self, args: &[JsRef], i: usize) -> Option<u32> {
        self.arg(args, i).as_id()
    }

    /// Wrap a filesystem result into the `(err)`/`(err, value)` callback
    /// convention.
    fn complete<T>(
        &mut self,
        callback: Option<u32>,
        result: Result<T, VfsError>,
        into: impl FnOnce(&mut Self, T) -> Vec<JsRef>,
    ) -> Dispatch {
        let Some(func) = callback else {
            return self.throw("missing callback argument");
        };
        let args = match result {
            Ok(value) => {
                let mut args = vec![JsRef::Null];
                args.extend(into(self, value));
                args
            }
            Err(err) => vec![self.error_ref(err)],
        };
        Dispatch::Callback {
            func,
            args,
            ret: JsRef::Undefined,
        }
    }

    // ---- fs ----

    fn call_fs(&mut self, method: &str, args: Vec<JsRef>) -> Dispatch {
        match method {
            "writeSync" => {
                let fd = self.arg_u32(&args, 0);
                let bytes = match self.byte_arg(&args, 1) {
                    Some(b) => b,
                    None => return self.throw("writeSync needs a byte buffer"),
                };
                match self.fs.write_sync(fd, &bytes) {
                    Ok(n) => Dispatch::Value(JsRef::Number(n as f64)),
                    Err(e) => {
                        let err = self.error_ref(e);
                        Dispatch::Error(err)
                    }
                }
            }
            "write" => {
                let fd = self.arg_u32(&args, 0);
                let offset = self.arg_usize(&args, 2);
                let length = self.arg_usize(&args, 3);
                let position = self.arg_pos(&args, 4);
                let callback = self.arg_callback(&args, 5);
                let result = match self.byte_arg_slice(&args, 1, offset, length) {
                    Some(data) => self.fs.write(fd, &data, position),
                    None => Err(VfsError::BadFd),
                };
                self.complete(callback, result, |_, n| vec![JsRef::Number(n as f64)])
            }
            "read" => {
                let fd = self.arg_u32(&args, 0);
                let buf = self.arg(&args, 1).as_id();
                let offset = self.arg_usize(&args, 2);
                let length = self.arg_usize(&args, 3);
                let position = self.arg_pos(&args, 4);
                let callback = self.arg_callback(&args, 5);

                let result = self.fs.read(fd, length, position).and_then(|data| {
                    let Some(Value::Bytes(bytes)) = buf.and_then(|id| self.heap.get_mut(id))
                    else {
                        return Err(VfsError::BadFd);
                    };
                    let end = (offset + data.len()).min(bytes.len());
                    let n = end.saturating_sub(offset);
                    if n > 0 {
                        bytes[offset..end].copy_from_slice(&data[..n]);
                    }
                    Ok(n)
                });
                self.complete(callback, result, |_, n| vec![JsRef::Number(n as f64)])
            }
            "open" => {
                let path = self.arg_str(&args, 0);
                let flags = self.arg_u32(&args, 1);
                let mode = self.arg_u32(&args, 2);
                let callback = self.arg_callback(&args, 3);
                let result = match path {
                    Some(p) => self.fs.open(&p, flags, mode),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |_, fd| vec![JsRef::Number(fd as f64)])
            }
            "close" => {
                let fd = self.arg_u32(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = self.fs.close(fd);
                self.complete(callback, result, |_, ()| vec![])
            }
            "stat" | "lstat" => {
                let path = self.arg_str(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = match path {
                    Some(p) if method == "stat" => self.fs.stat(&p),
                    Some(p) => self.fs.lstat(&p),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |host, st| vec![host.stat_ref(st)])
            }
            "fstat" => {
                let fd = self.arg_u32(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = self.fs.fstat(fd);
                self.complete(callback, result, |host, st| vec![host.stat_ref(st)])
            }
            "mkdir" => {
                let path = self.arg_str(&args, 0);
                let perm = self.arg_u32(&args, 1);
                let callback = self.arg_callback(&args, 2);
                let result = match path {
                    Some(p) => self.fs.mkdir(&p, perm),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |_, ()| vec![])
            }
            "readdir" => {
                let path = self.arg_str(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = match path {
                    Some(p) => self.fs.readdir(&p),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |host, names| {
                    let items = names
                        .into_iter()
                        .map(|name| host.string_ref(name))
                        .collect();
                    vec![JsRef::Id(host.heap.alloc(Value::Array(items)))]
                })
            }
            "unlink" => {
                let path = self.arg_str(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = match path {
                    Some(p) => self.fs.unlink(&p),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |_, ()| vec![])
            }
            "rename" => {
                let from = self.arg_str(&args, 0);
                let to = self.arg_str(&args, 1);
                let callback = self.arg_callback(&args, 2);
                let result = match (from, to) {
                    (Some(f), Some(t)) => self.fs.rename(&f, &t),
                    _ => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |_, ()| vec![])
            }
            "rmdir" => {
                let path = self.arg_str(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = match path {
                    Some(p) => self.fs.rmdir(&p),
                    None => Err(VfsError::NotFound),
                };
                self.complete(callback, result, |_, ()| vec![])
            }
            "fsync" => {
                let fd = self.arg_u32(&args, 0);
                let callback = self.arg_callback(&args, 1);
                let result = self.fs.fsync(fd);
                self.complete(callback, result, |_, ()| vec![])
            }
            other => self.throw(&format!("fs.{other} is not a function")),
        }
    }

    /// The bytes behind a `Uint8Array` argument.
    fn byte_arg(&self, args: &[JsRef], i: usize) -> Option<Vec<u8>> {
        match self.heap.get(self.arg(args, i).as_id()?)? {
            Value::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    fn byte_arg_slice(
        &self,
        args: &[JsRef],
        i: usize,
        offset: usize,
        length: usize,
    ) -> Option<Vec<u8>> {
        let bytes = self.byte_arg(args, i)?;
        let end = (offset + length).min(bytes.len());
        Some(bytes.get(offset..end)?.to_vec())
    }

    fn stat_ref(&mut self, st: FileStat) -> JsRef {
        let id = self.heap.alloc(Value::object("Stats"));
        for (key, value) in [
            ("dev", st.dev as f64),
            ("ino", st.ino as f64),
            ("mode", st.mode as f64),
            ("nlink", st.nlink as f64),
            ("uid", st.uid as f64),
            ("gid", st.gid as f64),
            ("rdev", st.rdev as f64),
            ("size", st.size as f64),
            ("blksize", st.blksize as f64),
            ("blocks", st.blocks as f64),
            ("atimeMs", st.atime_ms as f64),
            ("mtimeMs", st.mtime_ms as f64),
            ("ctimeMs", st.ctime_ms as f64),
        ] {
            self.heap.set_prop(id, key, JsRef::Number(value));
        }
        self.add_method(id, "isDirectory");
        self.add_method(id, "isFile");
        JsRef::Id(id)
    }

    fn call_stats(&mut self, id: u32, method: &str) -> Dispatch {
        let mode = self
            .heap
            .props(id)
            .and_then(|props| props.get("mode").copied())
            .and_then(|r| r.as_number())
            .unwrap_or(0.0) as u32;
        match method {
            "isDirectory" => Dispatch::Value(JsRef::Bool(mode & 0o170000 == 0o40000)),
            "isFile" => Dispatch::Value(JsRef::Bool(mode & 0o170000 != 0o40000)),
            other => self.throw(&format!("Stats.{other} is not a function")),
        }
    }

    // ---- process ----

    fn call_process(&mut self, method: &str, args: Vec<JsRef>) -> Dispatch {
        match method {
            "cwd" => {
                let cwd = self.fs.cwd();
                Dispatch::Value(self.string_ref(cwd))
            }
            "chdir" => {
                let path = self.arg_str(&args, 0);
                let result = match path {
                    Some(p) => self.fs.chdir(&p),
                    None => Err(VfsError::NotFound),
                };
                match result {
                    Ok(()) => Dispatch::Value(JsRef::Undefined),
                    Err(e) => {
                        let err = self.error_ref(e);
                        Dispatch::Error(err)
                    }
                }
            }
            "getuid" | "getgid" | "geteuid" | "getegid" => Dispatch::Value(JsRef::Number(0.0)),
            "umask" => Dispatch::Value(JsRef::Number(0o22 as f64)),
            other => self.throw(&format!("process.{other} is not a function")),
        }
    }

    fn get_random_values(&mut self, args: Vec<JsRef>) -> Dispatch {
        let target = self.arg(&args, 0);
        if let Some(Value::Bytes(bytes)) = target.as_id().and_then(|id| self.heap.get_mut(id)) {
            rand::thread_rng().fill_bytes(bytes);
            Dispatch::Value(target)
        } else {
            self.throw("getRandomValues needs a typed array")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goscript_vfs::{CaptureSink, SharedSink, Vfs};
    use pretty_assertions::assert_eq;

    fn host() -> JsHost {
        JsHost::new(FsOps::new(Vfs::new()))
    }

    fn get(host: &mut JsHost, target: JsRef, key: &str) -> JsRef {
        host.reflect_get(target, key)
    }

    #[test]
    fn published_constants_match_the_contract() {
        let mut host = host();
        let fs = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        let constants = get(&mut host, fs, "constants");

        let expected = [
            ("O_WRONLY", 1.0),
            ("O_RDWR", 2.0),
            ("O_CREAT", 64.0),
            ("O_TRUNC", 512.0),
            ("O_APPEND", 1024.0),
            ("O_EXCL", 128.0),
            ("O_DIRECTORY", 65536.0),
        ];
        for (name, value) in expected {
            assert_eq!(get(&mut host, constants, name), JsRef::Number(value), "{name}");
        }
    }

    #[test]
    fn write_sync_to_stdout_returns_the_byte_count() {
        let sink = CaptureSink::new();
        let buffer = sink.buffer();
        let fs = FsOps::new(Vfs::new()).with_stdout(SharedSink::new(sink));
        let mut host = JsHost::new(fs);

        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        let buf = host.heap.alloc(Value::Bytes(b"hello\n".to_vec()));
        let outcome = host.call(fs_obj, "writeSync", vec![JsRef::Number(1.0), JsRef::Id(buf)]);

        assert_eq!(outcome, Dispatch::Value(JsRef::Number(6.0)));
        assert_eq!(buffer.contents(), "hello\n");
    }

    fn make_callback(host: &mut JsHost) -> u32 {
        let this = JsRef::Id(ID_THIS);
        match host.call(this, "_makeFuncWrapper", vec![JsRef::Number(7.0)]) {
            Dispatch::Value(JsRef::Id(id)) => id,
            other => panic!("expected a wrapper, got {other:?}"),
        }
    }

    #[test]
    fn open_missing_file_delivers_enoent_to_the_callback() {
        let mut host = host();
        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        let cb = make_callback(&mut host);
        let path = host.string_ref("/missing.go");

        let outcome = host.call(
            fs_obj,
            "open",
            vec![path, JsRef::Number(0.0), JsRef::Number(0.0), JsRef::Id(cb)],
        );
        let Dispatch::Callback { func, args, ret } = outcome else {
            panic!("expected a callback outcome");
        };
        assert_eq!(func, cb);
        assert_eq!(ret, JsRef::Undefined);
        assert_eq!(args.len(), 1);
        let code = host.reflect_get(args[0], "code");
        assert_eq!(host.js_string(code).as_deref(), Some("ENOENT"));
    }

    #[test]
    fn open_and_read_round_trip_through_callbacks() {
        let mut host = host();
        host.fs.vfs().write_file("/f", "abc");
        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");

        let cb = make_callback(&mut host);
        let path = host.string_ref("/f");
        let opened = host.call(
            fs_obj,
            "open",
            vec![path, JsRef::Number(0.0), JsRef::Number(0.0), JsRef::Id(cb)],
        );
        let Dispatch::Callback { args, .. } = opened else {
            panic!("expected a callback outcome");
        };
        assert_eq!(args[0], JsRef::Null);
        let fd = args[1];

        let buf = host.heap.alloc(Value::Bytes(vec![0; 8]));
        let cb = make_callback(&mut host);
        let read = host.call(
            fs_obj,
            "read",
            vec![
                fd,
                JsRef::Id(buf),
                JsRef::Number(0.0),
                JsRef::Number(8.0),
                JsRef::Null,
                JsRef::Id(cb),
            ],
        );
        let Dispatch::Callback { args, .. } = read else {
            panic!("expected a callback outcome");
        };
        assert_eq!(args, vec![JsRef::Null, JsRef::Number(3.0)]);
        assert_eq!(
            host.heap.get(buf),
            Some(&Value::Bytes(vec![b'a', b'b', b'c', 0, 0, 0, 0, 0]))
        );
    }

    #[test]
    fn stat_exposes_the_numeric_attributes() {
        let mut host = host();
        host.fs.vfs().write_file("/f", "12345");
        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        let cb = make_callback(&mut host);
        let path = host.string_ref("/f");

        let Dispatch::Callback { args, .. } = host.call(fs_obj, "stat", vec![path, JsRef::Id(cb)])
        else {
            panic!("expected a callback outcome");
        };
        let st = args[1];
        assert_eq!(host.reflect_get(st, "size"), JsRef::Number(5.0));
        assert_eq!(host.reflect_get(st, "mode"), JsRef::Number(0o666 as f64));
        assert_eq!(host.call(st, "isFile", vec![]), Dispatch::Value(JsRef::Bool(true)));
        assert_eq!(
            host.call(st, "isDirectory", vec![]),
            Dispatch::Value(JsRef::Bool(false))
        );
    }

    #[test]
    fn readdir_yields_an_array_of_names() {
        let mut host = host();
        host.fs.vfs().write_file("/d/b", "");
        host.fs.vfs().write_file("/d/a", "");
        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        let cb = make_callback(&mut host);
        let path = host.string_ref("/d");

        let Dispatch::Callback { args, .. } =
            host.call(fs_obj, "readdir", vec![path, JsRef::Id(cb)])
        else {
            panic!("expected a callback outcome");
        };
        let arr = args[1];
        assert_eq!(host.length(arr), 2);
        let first = host.index(arr, 0);
        let second = host.index(arr, 1);
        assert_eq!(host.js_string(first).as_deref(), Some("a"));
        assert_eq!(host.js_string(second).as_deref(), Some("b"));
    }

    #[test]
    fn queue_event_stages_the_pending_event() {
        let mut host = host();
        let cb = make_callback(&mut host);
        host.queue_event(cb, vec![JsRef::Null, JsRef::Number(3.0)]);

        let event = host.reflect_get(JsRef::Id(ID_THIS), "_pendingEvent");
        assert_eq!(host.reflect_get(event, "id"), JsRef::Number(7.0));
        assert_eq!(host.reflect_get(event, "this"), JsRef::Id(cb));
        let args = host.reflect_get(event, "args");
        assert_eq!(host.length(args), 2);
        assert_eq!(host.index(args, 1), JsRef::Number(3.0));

        // the guest clears the slot once it has consumed the event
        host.reflect_set(JsRef::Id(ID_THIS), "_pendingEvent", JsRef::Null);
        assert_eq!(
            host.reflect_get(JsRef::Id(ID_THIS), "_pendingEvent"),
            JsRef::Null
        );
    }

    #[test]
    fn uint8_array_constructs_zeroed_buffers() {
        let mut host = host();
        let ctor = get(&mut host, JsRef::Id(ID_GLOBAL), "Uint8Array");
        let Dispatch::Value(buf) = host.construct(ctor, vec![JsRef::Number(4.0)]) else {
            panic!("expected a value");
        };
        assert_eq!(host.length(buf), 4);
        assert!(host.instance_of(buf, ctor));
    }

    #[test]
    fn get_random_values_fills_the_buffer() {
        let mut host = host();
        let crypto = get(&mut host, JsRef::Id(ID_GLOBAL), "crypto");
        let buf = host.heap.alloc(Value::Bytes(vec![0; 16]));

        let outcome = host.call(crypto, "getRandomValues", vec![JsRef::Id(buf)]);
        assert_eq!(outcome, Dispatch::Value(JsRef::Id(buf)));
        // 16 zero bytes after filling would be a 2^-128 event
        let Some(Value::Bytes(bytes)) = host.heap.get(buf) else {
            unreachable!()
        };
        assert!(bytes.iter().any(|b| *b != 0));
    }

    #[test]
    fn cwd_and_chdir_flow_through_the_vfs() {
        let mut host = host();
        host.fs.vfs().create_dir("/work");
        let process = get(&mut host, JsRef::Id(ID_GLOBAL), "process");

        let Dispatch::Value(cwd) = host.call(process, "cwd", vec![]) else {
            panic!("expected a value");
        };
        assert_eq!(host.js_string(cwd).as_deref(), Some("/"));

        let path = host.string_ref("/work");
        assert_eq!(
            host.call(process, "chdir", vec![path]),
            Dispatch::Value(JsRef::Undefined)
        );
        let Dispatch::Value(cwd) = host.call(process, "cwd", vec![]) else {
            panic!("expected a value");
        };
        assert_eq!(host.js_string(cwd).as_deref(), Some("/work"));

        let bad = host.string_ref("/nope");
        assert!(matches!(
            host.call(process, "chdir", vec![bad]),
            Dispatch::Error(_)
        ));
    }

    #[test]
    fn unknown_methods_throw() {
        let mut host = host();
        let fs_obj = get(&mut host, JsRef::Id(ID_GLOBAL), "fs");
        assert!(matches!(host.call(fs_obj, "symlink", vec![]), Dispatch::Error(_)));
    }
}
