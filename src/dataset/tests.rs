use super::{
    csv,
    mnist::{balance, Mnist},
    pickle::{self, Dtype, Value},
};
use anyhow::Result;
use flate2::{write::GzEncoder, Compression};
use ndarray::{arr1, arr2, Array, Array1, Array2, Axis};
use std::{fs::File, io::Write};

/// Writes protocol 2 pickles the way Python 2 pickled the archive.
struct Pickler {
    bytes: Vec<u8>,
}

impl Pickler {
    fn new() -> Self {
        Self {
            bytes: vec![0x80, 2],
        }
    }
    fn op(&mut self, op: u8) -> &mut Self {
        self.bytes.push(op);
        self
    }
    fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.op(b'c');
        self.bytes.extend_from_slice(module.as_bytes());
        self.bytes.push(b'\n');
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(b'\n');
        self
    }
    fn int(&mut self, x: i32) -> &mut Self {
        if (0..256).contains(&x) {
            self.op(b'K').op(x as u8)
        } else if (0..65536).contains(&x) {
            self.op(b'M');
            self.bytes.extend_from_slice(&(x as u16).to_le_bytes());
            self
        } else {
            self.op(b'J');
            self.bytes.extend_from_slice(&x.to_le_bytes());
            self
        }
    }
    fn short_string(&mut self, s: &[u8]) -> &mut Self {
        self.op(b'U').op(s.len() as u8);
        self.bytes.extend_from_slice(s);
        self
    }
    fn string(&mut self, s: &[u8]) -> &mut Self {
        self.op(b'T');
        self.bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(s);
        self
    }
    fn put(&mut self, index: u8) -> &mut Self {
        self.op(b'q').op(index)
    }
    fn get(&mut self, index: u8) -> &mut Self {
        self.op(b'h').op(index)
    }
    fn dtype(&mut self, descr: &str, order: &str) -> &mut Self {
        self.dtype_object(descr).dtype_state(order)
    }
    /// `numpy.dtype(descr, 0, 1)`, not yet built.
    fn dtype_object(&mut self, descr: &str) -> &mut Self {
        self.global("numpy", "dtype")
            .short_string(descr.as_bytes())
            .int(0)
            .int(1)
            .op(0x87)
            .op(b'R')
    }
    /// Builds the dtype on the stack with byte `order`.
    fn dtype_state(&mut self, order: &str) -> &mut Self {
        self.op(b'(')
            .int(3)
            .short_string(order.as_bytes())
            .op(b'N')
            .op(b'N')
            .op(b'N')
            .int(-1)
            .int(-1)
            .int(0)
            .op(b't')
            .op(b'b')
    }
    /// An ndarray, with the dtype written by `dtype`.
    fn ndarray(
        &mut self,
        shape: &[usize],
        dtype: impl FnOnce(&mut Self),
        fortran_order: bool,
        data: &[u8],
    ) -> &mut Self {
        self.global("numpy.core.multiarray", "_reconstruct")
            .global("numpy", "ndarray")
            .int(0)
            .op(0x85)
            .short_string(b"b")
            .op(0x87)
            .op(b'R')
            .op(b'(')
            .int(1)
            .op(b'(');
        for dim in shape {
            self.int(*dim as i32);
        }
        self.op(b't');
        dtype(self);
        self.op(if fortran_order { 0x88 } else { 0x89 })
            .string(data)
            .op(b't')
            .op(b'b')
    }
    fn finish(&mut self) -> Vec<u8> {
        self.op(b'.');
        std::mem::take(&mut self.bytes)
    }
}

fn f4_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn i8_bytes(data: &[i64]) -> Vec<u8> {
    data.iter().flat_map(|x| x.to_le_bytes()).collect()
}

#[test]
fn pickle_values() -> Result<()> {
    let bytes = Pickler::new()
        .op(b'}')
        .put(0)
        .op(b'(')
        .short_string(b"a")
        .op(b']')
        .int(1)
        .op(b'a')
        .int(300)
        .op(b'a')
        .short_string(b"b")
        .op(0x8a)
        .op(2)
        .op(0x00)
        .op(0x80)
        .short_string(b"c")
        .get(0)
        .short_string(b"d")
        .op(0x88)
        .op(b'u')
        .finish();
    let value = pickle::from_reader(bytes.as_slice())?;
    let items = match value {
        Value::Dict(items) => items,
        value => panic!("{value:?}"),
    };
    assert_eq!(items.len(), 4);
    assert_eq!(
        items[0],
        (
            Value::Bytes(b"a".to_vec().into()),
            Value::List(vec![Value::Int(1), Value::Int(300)])
        )
    );
    assert_eq!(items[1].1, Value::Int(-32768));
    // The memo holds the dict as it was when memoized.
    assert_eq!(items[2].1, Value::Dict(Vec::new()));
    assert_eq!(items[3].1, Value::Bool(true));
    Ok(())
}

#[test]
fn pickle_protocol_4() -> Result<()> {
    let mut bytes = vec![0x80, 4, 0x95];
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&[0x8c, 2, b'h', b'i', 0x94, b'G']);
    bytes.extend_from_slice(&1.5f64.to_be_bytes());
    bytes.extend_from_slice(&[b'h', 0, 0x87, b'.']);
    let value = pickle::from_reader(bytes.as_slice())?;
    assert_eq!(
        value,
        Value::Tuple(vec![
            Value::String("hi".into()),
            Value::Float(1.5),
            Value::String("hi".into()),
        ])
    );
    Ok(())
}

#[test]
fn pickle_errors() {
    let truncated = Pickler::new().short_string(b"abc").bytes[..4].to_vec();
    assert!(pickle::from_reader(truncated.as_slice()).is_err());
    let no_stop = Pickler::new().int(1).bytes.clone();
    assert!(pickle::from_reader(no_stop.as_slice()).is_err());
    let unsupported = Pickler::new().op(0xff).finish();
    let error = pickle::from_reader(unsupported.as_slice()).unwrap_err();
    assert!(error.to_string().contains("0xff"), "{error}");
    let unknown_memo = Pickler::new().get(3).finish();
    assert!(pickle::from_reader(unknown_memo.as_slice()).is_err());
    let empty_stack = Pickler::new().op(0x86).finish();
    assert!(pickle::from_reader(empty_stack.as_slice()).is_err());
}

#[test]
fn pickle_ndarray_f4() -> Result<()> {
    let data = [0., 0.5, 1., 0.25, 0.125, 0.75];
    let bytes = Pickler::new()
        .ndarray(&[2, 3], |p| { p.dtype("f4", "<"); }, false, &f4_bytes(&data))
        .finish();
    let array = pickle::from_reader(bytes.as_slice())?.to_ndarray()?;
    assert_eq!(array.shape(), &[2, 3]);
    assert_eq!(array.dtype(), Dtype::F4 { little: true });
    let array = array.to_f32()?;
    assert_eq!(array, arr2(&[[0., 0.5, 1.], [0.25, 0.125, 0.75]]).into_dyn());
    Ok(())
}

#[test]
fn pickle_ndarray_fortran_big_endian() -> Result<()> {
    // Column major [[1, 2, 3], [4, 5, 6]].
    let data: Vec<u8> = [1f32, 4., 2., 5., 3., 6.]
        .iter()
        .flat_map(|x| x.to_be_bytes())
        .collect();
    let bytes = Pickler::new()
        .ndarray(&[2, 3], |p| { p.dtype("f4", ">"); }, true, &data)
        .finish();
    let array = pickle::from_reader(bytes.as_slice())?.to_ndarray()?.to_f32()?;
    assert_eq!(array, arr2(&[[1., 2., 3.], [4., 5., 6.]]).into_dyn());
    assert!(array.is_standard_layout());
    Ok(())
}

#[test]
fn pickle_ndarray_classes() -> Result<()> {
    let bytes = Pickler::new()
        .op(b'(')
        .ndarray(&[3], |p| { p.dtype("i8", "<").put(1); }, false, &i8_bytes(&[7, 0, 9]))
        .ndarray(&[2], |p| { p.get(1); }, false, &i8_bytes(&[255, 1]))
        .ndarray(&[1], |p| { p.get(1); }, false, &i8_bytes(&[256]))
        .op(b't')
        .finish();
    let value = pickle::from_reader(bytes.as_slice())?;
    let items = value.as_items().unwrap();
    assert_eq!(items[0].to_ndarray()?.to_classes()?, arr1(&[7, 0, 9]));
    assert_eq!(items[1].to_ndarray()?.to_classes()?, arr1(&[255, 1]));
    assert!(items[2].to_ndarray()?.to_classes().is_err());
    Ok(())
}

#[test]
fn pickle_ndarray_memoized_dtype() -> Result<()> {
    // The dtype is memoized between REDUCE and BUILD, then fetched again for the second array.
    let data: Vec<u8> = [1f32, -2.5].iter().flat_map(|x| x.to_be_bytes()).collect();
    let bytes = Pickler::new()
        .op(b'(')
        .ndarray(&[2], |p| { p.dtype_object("f4").put(7).dtype_state(">"); }, false, &data)
        .ndarray(&[2], |p| { p.get(7); }, false, &data)
        .op(b't')
        .finish();
    let value = pickle::from_reader(bytes.as_slice())?;
    let items = value.as_items().unwrap();
    for item in items {
        let array = item.to_ndarray()?;
        assert_eq!(array.dtype(), Dtype::F4 { little: false });
        assert_eq!(array.to_f32()?, arr1(&[1., -2.5]).into_dyn());
    }
    Ok(())
}

#[test]
fn pickle_ndarray_invalid() -> Result<()> {
    let short = Pickler::new()
        .ndarray(&[2, 3], |p| { p.dtype("f4", "<"); }, false, &f4_bytes(&[1., 2.]))
        .finish();
    assert!(pickle::from_reader(short.as_slice())?.to_ndarray().is_err());
    let unsupported = Pickler::new()
        .ndarray(&[1], |p| { p.dtype("c8", "<"); }, false, &[0; 8])
        .finish();
    assert!(pickle::from_reader(unsupported.as_slice())?.to_ndarray().is_err());
    assert!(Value::Int(1).to_ndarray().is_err());
    Ok(())
}

/// Images of `n` examples, with pixel 0 set to the index of the example.
fn split(p: &mut Pickler, classes: &[i64]) {
    let mut images = Array2::<f32>::zeros([classes.len(), 784]);
    for (i, mut image) in images.outer_iter_mut().enumerate() {
        image[0] = i as f32;
        image[783] = 1.;
    }
    let images = images.as_slice().unwrap();
    p.ndarray(&[classes.len(), 784], |p| { p.dtype("f4", "<"); }, false, &f4_bytes(images))
        .ndarray(&[classes.len()], |p| { p.dtype("i8", "<"); }, false, &i8_bytes(classes))
        .op(0x86);
}

fn write_archive(path: &std::path::Path, bytes: &[u8]) -> Result<()> {
    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()?;
    Ok(())
}

#[test]
fn mnist_archive() -> Result<()> {
    let mut p = Pickler::new();
    split(&mut p, &[0, 1, 1, 2]);
    split(&mut p, &[2, 0]);
    split(&mut p, &[9, 9, 3]);
    let bytes = p.op(0x87).finish();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mnist.pkl.gz");
    write_archive(&path, &bytes)?;
    let mnist = Mnist::builder().path(&path).build()?;
    assert_eq!(mnist.path(), path);
    assert_eq!(mnist.train().len(), 4);
    assert_eq!(mnist.validation().len(), 2);
    assert_eq!(mnist.test().len(), 3);
    assert_eq!(mnist.train().images().dim(), (4, 784));
    assert_eq!(mnist.validation().classes(), arr1(&[2, 0]));
    let balanced = mnist.balanced(1, 2)?;
    // Validation examples follow the training examples.
    assert_eq!(balanced.train_classes, arr1(&[0, 1, 2]));
    assert_eq!(balanced.train_images.dim(), (3, 1, 28, 28));
    assert_eq!(balanced.train_images[[2, 0, 0, 0]], 3.);
    assert_eq!(balanced.train_images[[2, 0, 27, 27]], 1.);
    assert_eq!(balanced.test_classes, arr1(&[9, 9, 3]));
    Ok(())
}

#[test]
fn mnist_archive_invalid() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mnist.pkl.gz");
    let mut p = Pickler::new();
    split(&mut p, &[0]);
    split(&mut p, &[0]);
    let bytes = p.op(0x86).finish();
    write_archive(&path, &bytes)?;
    assert!(Mnist::builder().path(&path).build().is_err());
    assert!(Mnist::builder()
        .path(dir.path().join("missing.pkl.gz"))
        .build()
        .is_err());
    Ok(())
}

#[test]
fn balance_quota() -> Result<()> {
    let classes = arr1(&[3u8, 3, 1, 3, 12, 1, 1, 0]);
    let images = Array::from_shape_fn([classes.len(), 784], |(i, _)| i as f32);
    let (selected, selected_classes) = balance(images.view(), classes.view(), 2)?;
    assert_eq!(selected_classes, arr1(&[3, 3, 1, 1, 0]));
    assert_eq!(selected.dim(), (5, 1, 28, 28));
    let rows: Vec<f32> = selected.outer_iter().map(|x| x[[0, 0, 0]]).collect();
    assert_eq!(rows, vec![0., 1., 2., 5., 7.]);
    let (selected, selected_classes) = balance(images.view(), classes.view(), 0)?;
    assert_eq!(selected.dim(), (0, 1, 28, 28));
    assert!(selected_classes.is_empty());
    Ok(())
}

#[test]
fn balance_stops_when_full() -> Result<()> {
    let classes: Array1<u8> = (0..25).map(|i| (i % 10) as u8).collect();
    let images = Array::from_shape_fn([classes.len(), 784], |(i, _)| i as f32);
    let (selected, selected_classes) = balance(images.view(), classes.view(), 1)?;
    assert_eq!(selected_classes, (0..10).collect::<Array1<u8>>());
    assert_eq!(selected.index_axis(Axis(0), 9)[[0, 0, 0]], 9.);
    assert!(balance(images.view(), classes.slice(ndarray::s![..3]), 1).is_err());
    Ok(())
}

#[test]
fn csv_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let images = Array::from_shape_fn([3, 1, 2, 2], |(i, _, r, c)| (i * 4 + r * 2 + c) as f32 / 8.);
    let classes = arr1(&[4u8, 0, 9]);
    let images_path = dir.path().join("images.csv");
    let classes_path = dir.path().join("labels.csv");
    csv::write_images(&images_path, &images)?;
    csv::write_classes(&classes_path, classes.view())?;
    let text = std::fs::read_to_string(&images_path)?;
    assert_eq!(text.lines().next(), Some("0,0.125,0.25,0.375"));
    assert_eq!(
        csv::read_images(&images_path)?,
        images.into_shape([3, 4])?
    );
    assert_eq!(csv::read_classes(&classes_path)?, classes);
    Ok(())
}

#[test]
fn csv_invalid() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bad.csv");
    std::fs::write(&path, "1,2\n3\n")?;
    assert!(csv::read_images(&path).is_err());
    std::fs::write(&path, "1\n256\n")?;
    let error = csv::read_classes(&path).unwrap_err();
    assert!(format!("{error:#}").contains(":2:"), "{error:#}");
    Ok(())
}
