//! A minimal unpickler.
//!
//! Supports the opcodes of protocols 0 to 4 that pickled tuples, lists, dicts and NumPy arrays
//! are made of. Objects are not constructed, a `REDUCE` / `NEWOBJ` / `BUILD` is recorded as a
//! [`Value::Object`] to be interpreted by the caller, see [`Value::to_ndarray()`].
use anyhow::{anyhow, bail, ensure, Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use ndarray::{Array1, ArrayD, IxDyn, ShapeBuilder};
use std::{collections::HashMap, io::Read, rc::Rc};

/// A pickled value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// `None`.
    None,
    /// A bool.
    Bool(bool),
    /// An int.
    Int(i64),
    /// A float.
    Float(f64),
    /// Bytes, including python 2 `str`.
    Bytes(Rc<[u8]>),
    /// A unicode string.
    String(String),
    /// A tuple.
    Tuple(Vec<Value>),
    /// A list.
    List(Vec<Value>),
    /// A dict, in insertion order.
    Dict(Vec<(Value, Value)>),
    /// A global, ie a class or function.
    Global {
        /// The module.
        module: String,
        /// The name.
        name: String,
    },
    /// The result of calling `callable` with `args`, then setting `state`.
    Object {
        /// The callable.
        callable: Box<Value>,
        /// The arguments.
        args: Box<Value>,
        /// The state, if built.
        state: Option<Box<Value>>,
    },
}

impl Value {
    /// Returns the items of a tuple or list.
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) | Self::List(items) => Some(items),
            _ => None,
        }
    }
    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(x) => Some(*x),
            Self::Bool(x) => Some(*x as i64),
            _ => None,
        }
    }
    fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(x) => Some(x),
            Self::Bytes(x) => std::str::from_utf8(x).ok(),
            _ => None,
        }
    }
    fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Self::Global { module: m, name: n } if m == module && n == name)
    }
    /// Interprets a pickled NumPy array.
    ///
    /// **Errors**
    ///
    /// The value is not a `numpy.core.multiarray._reconstruct` object, or its dtype is not
    /// supported.
    pub fn to_ndarray(&self) -> Result<NdArray> {
        let (callable, state) = match self {
            Self::Object {
                callable,
                state: Some(state),
                ..
            } => (callable, state),
            _ => bail!("Expected ndarray, found {}!", self.kind()),
        };
        ensure!(
            callable.is_global("numpy.core.multiarray", "_reconstruct")
                || callable.is_global("numpy._core.multiarray", "_reconstruct"),
            "Expected numpy.core.multiarray._reconstruct, found {callable:?}!"
        );
        let state = state
            .as_items()
            .ok_or_else(|| anyhow!("Expected ndarray state tuple!"))?;
        let (shape, dtype, fortran_order, data) = match state {
            [_version, shape, dtype, fortran_order, data] => (shape, dtype, fortran_order, data),
            [shape, dtype, fortran_order, data] => (shape, dtype, fortran_order, data),
            _ => bail!("Expected ndarray state of 4 or 5 items, found {}!", state.len()),
        };
        let shape = shape
            .as_items()
            .ok_or_else(|| anyhow!("Expected ndarray shape tuple!"))?
            .iter()
            .map(|x| {
                x.as_int()
                    .and_then(|x| usize::try_from(x).ok())
                    .ok_or_else(|| anyhow!("Invalid ndarray dimension {x:?}!"))
            })
            .collect::<Result<Vec<_>>>()?;
        let dtype = Dtype::from_value(dtype)?;
        let fortran_order = fortran_order
            .as_int()
            .ok_or_else(|| anyhow!("Expected ndarray fortran order flag!"))?
            != 0;
        let data = data.to_bytes()?;
        let len = shape.iter().product::<usize>();
        ensure!(
            data.len() == len * dtype.size(),
            "Expected {} bytes of ndarray data, found {}!",
            len * dtype.size(),
            data.len()
        );
        Ok(NdArray {
            shape,
            dtype,
            fortran_order,
            data,
        })
    }
    /// Array data, either bytes, a latin-1 str, or `_codecs.encode(str, "latin1")`.
    fn to_bytes(&self) -> Result<Rc<[u8]>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::String(string) => latin1(string),
            Self::Object { callable, args, .. } if callable.is_global("_codecs", "encode") => {
                match args.as_items() {
                    Some([Self::String(string), ..]) => latin1(string),
                    _ => bail!("Expected _codecs.encode(str, encoding)!"),
                }
            }
            _ => bail!("Expected ndarray data, found {}!", self.kind()),
        }
    }
    fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Global { .. } => "global",
            Self::Object { .. } => "object",
        }
    }
}

fn latin1(string: &str) -> Result<Rc<[u8]>> {
    string
        .chars()
        .map(|c| u8::try_from(c).map_err(|_| anyhow!("Character {c:?} is not latin-1!")))
        .collect()
}

/// The element type of an [`NdArray`].
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dtype {
    F4 { little: bool },
    F8 { little: bool },
    I1,
    I2 { little: bool },
    I4 { little: bool },
    I8 { little: bool },
    U1,
}

impl Dtype {
    /// A `numpy.dtype(descr, ...)` object, with the byte order in its state.
    fn from_value(value: &Value) -> Result<Self> {
        let (callable, args, state) = match value {
            Value::Object {
                callable,
                args,
                state,
            } => (callable, args, state),
            _ => bail!("Expected dtype, found {}!", value.kind()),
        };
        ensure!(
            callable.is_global("numpy", "dtype"),
            "Expected numpy.dtype, found {callable:?}!"
        );
        let descr = args
            .as_items()
            .and_then(|args| args.first())
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Expected dtype descriptor!"))?;
        let order = state
            .as_deref()
            .and_then(Value::as_items)
            .and_then(|state| state.get(1))
            .and_then(Value::as_str)
            .unwrap_or("|");
        let little = match order {
            ">" => false,
            "<" | "|" => true,
            "=" => cfg!(target_endian = "little"),
            _ => bail!("Unknown byte order {order:?}!"),
        };
        let dtype = match descr {
            "f4" => Self::F4 { little },
            "f8" => Self::F8 { little },
            "i1" => Self::I1,
            "i2" => Self::I2 { little },
            "i4" => Self::I4 { little },
            "i8" => Self::I8 { little },
            "u1" | "b1" => Self::U1,
            _ => bail!("Unsupported dtype {descr:?}!"),
        };
        Ok(dtype)
    }
    /// The size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::I1 | Self::U1 => 1,
            Self::I2 { .. } => 2,
            Self::F4 { .. } | Self::I4 { .. } => 4,
            Self::F8 { .. } | Self::I8 { .. } => 8,
        }
    }
}

/// A NumPy array.
#[derive(Clone, Debug)]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: Dtype,
    fortran_order: bool,
    data: Rc<[u8]>,
}

macro_rules! read_elements {
    ($data:expr, $len:expr, $little:expr, $read:ident as $T:ty) => {{
        let mut reader: &[u8] = $data;
        let mut output = Vec::<$T>::with_capacity($len);
        for _ in 0..$len {
            output.push(if $little {
                reader.$read::<LittleEndian>()? as $T
            } else {
                reader.$read::<BigEndian>()? as $T
            });
        }
        output
    }};
}

macro_rules! to_vec {
    ($array:expr, $T:ty) => {{
        let array = $array;
        let len = array.shape.iter().product::<usize>();
        let data: &[u8] = &array.data;
        match array.dtype {
            Dtype::F4 { little } => read_elements!(data, len, little, read_f32 as $T),
            Dtype::F8 { little } => read_elements!(data, len, little, read_f64 as $T),
            Dtype::I2 { little } => read_elements!(data, len, little, read_i16 as $T),
            Dtype::I4 { little } => read_elements!(data, len, little, read_i32 as $T),
            Dtype::I8 { little } => read_elements!(data, len, little, read_i64 as $T),
            Dtype::I1 => data.iter().map(|x| *x as i8 as $T).collect(),
            Dtype::U1 => data.iter().map(|x| *x as $T).collect(),
        }
    }};
}

impl NdArray {
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    /// The dtype.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }
    /// Converts to f32, in standard layout.
    ///
    /// **Errors**
    ///
    /// The data is truncated.
    pub fn to_f32(&self) -> Result<ArrayD<f32>> {
        let data: Vec<f32> = to_vec!(self, f32);
        let shape = IxDyn(&self.shape).set_f(self.fortran_order);
        let array = ArrayD::from_shape_vec(shape, data)?;
        Ok(array.as_standard_layout().into_owned())
    }
    /// Converts a vector of class labels to u8.
    ///
    /// **Errors**
    /// - The array is not 1 dimensional.
    /// - The dtype is not an integer type.
    /// - A label is not in 0..=255.
    pub fn to_classes(&self) -> Result<Array1<u8>> {
        ensure!(
            self.shape.len() == 1,
            "Expected labels of 1 dimension, found shape {:?}!",
            self.shape
        );
        ensure!(
            !matches!(self.dtype, Dtype::F4 { .. } | Dtype::F8 { .. }),
            "Expected integer labels, found {:?}!",
            self.dtype
        );
        let data: Vec<i64> = to_vec!(self, i64);
        data.into_iter()
            .map(|x| u8::try_from(x).map_err(|_| anyhow!("Invalid label {x}!")))
            .collect()
    }
}

/// Reads one pickled value from `reader`.
///
/// **Errors**
///
/// The stream is malformed, truncated, or uses an unsupported opcode.
pub fn from_reader<R: Read>(reader: R) -> Result<Value> {
    Unpickler::new(reader).load()
}

struct Unpickler<R> {
    reader: R,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<R: Read> Unpickler<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }
    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("Pickle stack underflow!"))
    }
    fn top(&mut self) -> Result<&mut Value> {
        self.stack
            .last_mut()
            .ok_or_else(|| anyhow!("Pickle stack underflow!"))
    }
    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self.marks.pop().ok_or_else(|| anyhow!("Pickle mark not found!"))?;
        ensure!(mark <= self.stack.len(), "Pickle mark past the stack!");
        Ok(self.stack.split_off(mark))
    }
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        (&mut self.reader)
            .take(len as u64)
            .read_to_end(&mut bytes)?;
        ensure!(bytes.len() == len, "Pickle truncated!");
        Ok(bytes)
    }
    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let byte = self.reader.read_u8()?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
        }
        Ok(String::from_utf8(line)?)
    }
    fn read_string(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8(self.read_bytes(len)?)?)
    }
    fn memoize(&mut self, index: u32) -> Result<()> {
        let value = self.top()?.clone();
        self.memo.insert(index, value);
        Ok(())
    }
    fn get(&mut self, index: u32) -> Result<()> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| anyhow!("Pickle memo {index} not found!"))?;
        self.stack.push(value);
        Ok(())
    }
    fn load(mut self) -> Result<Value> {
        loop {
            let opcode = self.reader.read_u8().context("Pickle truncated!")?;
            match opcode {
                // PROTO
                0x80 => {
                    self.reader.read_u8()?;
                }
                // FRAME
                0x95 => {
                    self.reader.read_u64::<LittleEndian>()?;
                }
                // STOP
                b'.' => return self.pop(),
                // MARK
                b'(' => self.marks.push(self.stack.len()),
                // POP
                b'0' => {
                    self.pop()?;
                }
                // POP_MARK
                b'1' => {
                    self.pop_mark()?;
                }
                // DUP
                b'2' => {
                    let value = self.top()?.clone();
                    self.stack.push(value);
                }
                // NONE
                b'N' => self.stack.push(Value::None),
                // NEWTRUE, NEWFALSE
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                // INT
                b'I' => {
                    let line = self.read_line()?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        line => Value::Int(line.parse()?),
                    };
                    self.stack.push(value);
                }
                // BININT, BININT1, BININT2
                b'J' => {
                    let x = self.reader.read_i32::<LittleEndian>()?;
                    self.stack.push(Value::Int(x.into()));
                }
                b'K' => {
                    let x = self.reader.read_u8()?;
                    self.stack.push(Value::Int(x.into()));
                }
                b'M' => {
                    let x = self.reader.read_u16::<LittleEndian>()?;
                    self.stack.push(Value::Int(x.into()));
                }
                // LONG1
                0x8a => {
                    let len = self.reader.read_u8()? as usize;
                    ensure!(len <= 8, "Pickle long of {len} bytes not supported!");
                    let bytes = self.read_bytes(len)?;
                    let mut x = 0i64;
                    for (i, byte) in bytes.iter().enumerate() {
                        x |= (*byte as i64) << (8 * i);
                    }
                    if len > 0 && len < 8 && bytes[len - 1] & 0x80 != 0 {
                        x -= 1 << (8 * len);
                    }
                    self.stack.push(Value::Int(x));
                }
                // BINFLOAT
                b'G' => {
                    let x = self.reader.read_f64::<BigEndian>()?;
                    self.stack.push(Value::Float(x));
                }
                // SHORT_BINSTRING, SHORT_BINBYTES
                b'U' | b'C' => {
                    let len = self.reader.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }
                // BINSTRING, BINBYTES
                b'T' | b'B' => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }
                // BINBYTES8
                0x8e => {
                    let len = self.reader.read_u64::<LittleEndian>()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }
                // SHORT_BINUNICODE
                0x8c => {
                    let len = self.reader.read_u8()? as usize;
                    let string = self.read_string(len)?;
                    self.stack.push(Value::String(string));
                }
                // BINUNICODE
                b'X' => {
                    let len = self.reader.read_u32::<LittleEndian>()? as usize;
                    let string = self.read_string(len)?;
                    self.stack.push(Value::String(string));
                }
                // BINUNICODE8
                0x8d => {
                    let len = self.reader.read_u64::<LittleEndian>()? as usize;
                    let string = self.read_string(len)?;
                    self.stack.push(Value::String(string));
                }
                // EMPTY_TUPLE, TUPLE, TUPLE1, TUPLE2, TUPLE3
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85..=0x87 => {
                    let len = (opcode - 0x84) as usize;
                    ensure!(self.stack.len() >= len, "Pickle stack underflow!");
                    let items = self.stack.split_off(self.stack.len() - len);
                    self.stack.push(Value::Tuple(items));
                }
                // EMPTY_LIST, LIST
                b']' => self.stack.push(Value::List(Vec::new())),
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                // APPEND
                b'a' => {
                    let item = self.pop()?;
                    match self.top()? {
                        Value::List(items) => items.push(item),
                        _ => bail!("Pickle APPEND to a non list!"),
                    }
                }
                // APPENDS
                b'e' => {
                    let new_items = self.pop_mark()?;
                    match self.top()? {
                        Value::List(items) => items.extend(new_items),
                        _ => bail!("Pickle APPENDS to a non list!"),
                    }
                }
                // EMPTY_DICT, DICT
                b'}' => self.stack.push(Value::Dict(Vec::new())),
                b'd' => {
                    let items = pairs(self.pop_mark()?)?;
                    self.stack.push(Value::Dict(items));
                }
                // SETITEM
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.top()? {
                        Value::Dict(items) => items.push((key, value)),
                        _ => bail!("Pickle SETITEM on a non dict!"),
                    }
                }
                // SETITEMS
                b'u' => {
                    let new_items = pairs(self.pop_mark()?)?;
                    match self.top()? {
                        Value::Dict(items) => items.extend(new_items),
                        _ => bail!("Pickle SETITEMS on a non dict!"),
                    }
                }
                // GLOBAL
                b'c' => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                // STACK_GLOBAL
                0x93 => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::String(module), Value::String(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => bail!("Pickle STACK_GLOBAL expects strings!"),
                    }
                }
                // REDUCE, NEWOBJ
                b'R' | 0x81 => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.stack.push(Value::Object {
                        callable: Box::new(callable),
                        args: Box::new(args),
                        state: None,
                    });
                }
                // BUILD
                b'b' => {
                    let new_state = self.pop()?;
                    let object = self.top()?;
                    let unbuilt = object.clone();
                    match object {
                        Value::Object { state, .. } => *state = Some(Box::new(new_state)),
                        _ => bail!("Pickle BUILD on a non object!"),
                    }
                    let built = object.clone();
                    // Objects are memoized before they are built.
                    for value in self.memo.values_mut().filter(|value| **value == unbuilt) {
                        *value = built.clone();
                    }
                }
                // PUT, BINPUT, LONG_BINPUT, MEMOIZE
                b'p' => {
                    let index = self.read_line()?.parse()?;
                    self.memoize(index)?;
                }
                b'q' => {
                    let index = self.reader.read_u8()?.into();
                    self.memoize(index)?;
                }
                b'r' => {
                    let index = self.reader.read_u32::<LittleEndian>()?;
                    self.memoize(index)?;
                }
                0x94 => {
                    let index = u32::try_from(self.memo.len())?;
                    self.memoize(index)?;
                }
                // GET, BINGET, LONG_BINGET
                b'g' => {
                    let index = self.read_line()?.parse()?;
                    self.get(index)?;
                }
                b'h' => {
                    let index = self.reader.read_u8()?.into();
                    self.get(index)?;
                }
                b'j' => {
                    let index = self.reader.read_u32::<LittleEndian>()?;
                    self.get(index)?;
                }
                _ => bail!("Unsupported pickle opcode 0x{opcode:02x}!"),
            }
        }
    }
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    ensure!(items.len() % 2 == 0, "Pickle dict with odd number of items!");
    let mut items = items.into_iter();
    let mut pairs = Vec::new();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}
