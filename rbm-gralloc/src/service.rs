// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The allocator service transport.
//!
//! The service listens on a Unix socket named after the platform service
//! instance.  Requests and responses are length-prefixed little-endian
//! frames; buffer handles travel as an integer payload plus SCM_RIGHTS
//! descriptors.

use crate::allocator::{
    AllocationResult, BufferDescriptorInfo, ExtendableType, RanchuAllocator,
};
use log::{debug, error};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use rbm::handle::RawHandle;
use rbm::{Error, Result};
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

pub const SERVICE_NAME: &str = "android.hardware.graphics.allocator.IAllocator/default";
pub const SOCKET_ENV: &str = "RBM_ALLOCATOR_SOCKET";

const MAX_WORKER_THREADS: usize = 4;
const MAX_FRAME_SIZE: u32 = 1 << 20;

const OP_ALLOCATE2: u32 = 1;
const OP_IS_SUPPORTED: u32 = 2;
const OP_GET_LIBRARY_SUFFIX: u32 = 3;
const OP_ALLOCATE: u32 = 4;

const STATUS_OK: i32 = 0;
const STATUS_BAD_DESCRIPTOR: i32 = 1;
const STATUS_NO_RESOURCES: i32 = 2;
const STATUS_UNSUPPORTED: i32 = 3;
const STATUS_BAD_BUFFER: i32 = 4;
const STATUS_BAD_VALUE: i32 = 5;

fn status_code(err: &Error) -> i32 {
    match err {
        Error::BadDescriptor => STATUS_BAD_DESCRIPTOR,
        Error::Unsupported => STATUS_UNSUPPORTED,
        Error::BadBuffer => STATUS_BAD_BUFFER,
        Error::BadValue => STATUS_BAD_VALUE,
        _ => STATUS_NO_RESOURCES,
    }
}

fn status_error(status: i32) -> Error {
    match status {
        STATUS_BAD_DESCRIPTOR => Error::BadDescriptor,
        STATUS_UNSUPPORTED => Error::Unsupported,
        STATUS_BAD_BUFFER => Error::BadBuffer,
        STATUS_BAD_VALUE => Error::BadValue,
        _ => Error::NoResources,
    }
}

pub fn default_socket_path() -> PathBuf {
    match std::env::var(SOCKET_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("/dev/socket").join(SERVICE_NAME),
    }
}

/// Serves `allocator` until the listener dies.  Uses a fixed pool of
/// worker threads, each handling one client at a time.
pub fn serve(listener: UnixListener, allocator: Arc<RanchuAllocator>) -> io::Result<()> {
    let mut workers = Vec::with_capacity(MAX_WORKER_THREADS);
    for n in 0..MAX_WORKER_THREADS {
        let listener = listener.try_clone()?;
        let allocator = allocator.clone();
        let worker = thread::Builder::new()
            .name(format!("rbm-allocator-{n}"))
            .spawn(move || worker_loop(listener, allocator))?;
        workers.push(worker);
    }

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn worker_loop(listener: UnixListener, allocator: Arc<RanchuAllocator>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_client(stream, &allocator) {
                    debug!("client connection ended: {err}");
                }
            }
            Err(err) => {
                error!("accept failed: {err}");
                return;
            }
        }
    }
}

fn handle_client(mut stream: UnixStream, allocator: &RanchuAllocator) -> io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut dec = Dec::new(&frame);
        match dec.u32()? {
            OP_ALLOCATE2 => {
                let desc = decode_descriptor(&mut dec)?;
                let count = dec.i32()?;
                match allocator.allocate2(&desc, count) {
                    Ok(result) => send_allocation(&mut stream, &result)?,
                    Err(err) => send_status(&mut stream, status_code(&err))?,
                }
            }
            OP_IS_SUPPORTED => {
                let desc = decode_descriptor(&mut dec)?;
                let supported = allocator.is_supported(&desc);
                let mut body = Vec::with_capacity(5);
                put_i32(&mut body, STATUS_OK);
                body.push(u8::from(supported));
                write_frame(&mut stream, &body)?;
            }
            OP_GET_LIBRARY_SUFFIX => {
                let suffix = allocator.imapper_library_suffix().as_bytes();
                let mut body = Vec::with_capacity(8 + suffix.len());
                put_i32(&mut body, STATUS_OK);
                put_u32(&mut body, suffix.len() as u32);
                body.extend_from_slice(suffix);
                write_frame(&mut stream, &body)?;
            }
            OP_ALLOCATE => {
                let encoded = dec.blob()?;
                let count = dec.i32()?;
                match allocator.allocate(&encoded, count) {
                    Ok(result) => send_allocation(&mut stream, &result)?,
                    Err(err) => send_status(&mut stream, status_code(&err))?,
                }
            }
            opcode => {
                error!("unknown opcode {opcode}");
                send_status(&mut stream, STATUS_BAD_VALUE)?;
            }
        }
    }
}

fn send_status(stream: &mut UnixStream, status: i32) -> io::Result<()> {
    let mut body = Vec::with_capacity(4);
    put_i32(&mut body, status);
    write_frame(stream, &body)
}

fn send_allocation(stream: &mut UnixStream, result: &AllocationResult) -> io::Result<()> {
    let mut body = Vec::with_capacity(12);
    put_i32(&mut body, STATUS_OK);
    put_u32(&mut body, result.stride);
    put_u32(&mut body, result.buffers.len() as u32);
    write_frame(stream, &body)?;

    for raw in &result.buffers {
        send_buffer(stream, raw)?;
    }
    Ok(())
}

/// One frame per buffer; the descriptors ride as ancillary data on it.
fn send_buffer(stream: &UnixStream, raw: &RawHandle) -> io::Result<()> {
    let mut payload = Vec::with_capacity(8 + raw.ints.len() * 4);
    put_u32(&mut payload, raw.fds.len() as u32);
    put_u32(&mut payload, raw.ints.len() as u32);
    for value in &raw.ints {
        put_u32(&mut payload, *value);
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    put_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(&payload);

    let fds: Vec<RawFd> = raw.fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(&fds)]
    };

    let iov = [IoSlice::new(&frame)];
    let sent = sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    if sent < frame.len() {
        // the descriptors went with the first chunk
        let mut writer = stream;
        writer.write_all(&frame[sent..])?;
    }
    Ok(())
}

fn recv_buffer(stream: &UnixStream) -> Result<RawHandle> {
    let mut buf = vec![0u8; 4096];

    let (received, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let mut fds: Vec<OwnedFd> = Vec::new();
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for fd in received {
                    // SAFETY: the kernel installed these descriptors for us
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        (msg.bytes, fds)
    };
    if received == 0 {
        return Err(Error::NoResources);
    }

    let mut data = buf[..received].to_vec();
    while data.len() < 4 {
        data.extend(read_some(stream)?);
    }
    let frame_len = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if frame_len > MAX_FRAME_SIZE {
        return Err(Error::BadValue);
    }
    while data.len() < 4 + frame_len as usize {
        data.extend(read_some(stream)?);
    }

    let mut dec = Dec::new(&data[4..4 + frame_len as usize]);
    let num_fds = dec.u32().map_err(Error::from)?;
    let num_ints = dec.u32().map_err(Error::from)?;
    if num_fds as usize != fds.len() {
        return Err(Error::BadBuffer);
    }
    let mut ints = Vec::with_capacity(num_ints as usize);
    for _ in 0..num_ints {
        ints.push(dec.u32().map_err(Error::from)?);
    }

    Ok(RawHandle { fds, ints })
}

fn read_some(stream: &UnixStream) -> Result<Vec<u8>> {
    let mut chunk = [0u8; 512];
    let mut reader = stream;
    let n = reader.read(&mut chunk).map_err(Error::from)?;
    if n == 0 {
        return Err(Error::NoResources);
    }
    Ok(chunk[..n].to_vec())
}

/// Client side of the allocator service.
pub struct AllocatorClient {
    stream: UnixStream,
}

impl AllocatorClient {
    pub fn connect(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    pub fn allocate2(
        &mut self,
        desc: &BufferDescriptorInfo,
        count: i32,
    ) -> Result<AllocationResult> {
        let mut body = Vec::new();
        put_u32(&mut body, OP_ALLOCATE2);
        encode_descriptor(&mut body, desc);
        put_i32(&mut body, count);
        write_frame(&mut self.stream, &body).map_err(Error::from)?;

        let frame = read_frame(&mut self.stream).map_err(Error::from)?;
        let mut dec = Dec::new(&frame);
        let status = dec.i32().map_err(Error::from)?;
        if status != STATUS_OK {
            return Err(status_error(status));
        }

        let stride = dec.u32().map_err(Error::from)?;
        let count = dec.u32().map_err(Error::from)?;
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            buffers.push(recv_buffer(&self.stream)?);
        }

        Ok(AllocationResult { stride, buffers })
    }

    pub fn is_supported(&mut self, desc: &BufferDescriptorInfo) -> Result<bool> {
        let mut body = Vec::new();
        put_u32(&mut body, OP_IS_SUPPORTED);
        encode_descriptor(&mut body, desc);
        write_frame(&mut self.stream, &body).map_err(Error::from)?;

        let frame = read_frame(&mut self.stream).map_err(Error::from)?;
        let mut dec = Dec::new(&frame);
        let status = dec.i32().map_err(Error::from)?;
        if status != STATUS_OK {
            return Err(status_error(status));
        }
        Ok(dec.u8().map_err(Error::from)? != 0)
    }

    pub fn imapper_library_suffix(&mut self) -> Result<String> {
        let mut body = Vec::new();
        put_u32(&mut body, OP_GET_LIBRARY_SUFFIX);
        write_frame(&mut self.stream, &body).map_err(Error::from)?;

        let frame = read_frame(&mut self.stream).map_err(Error::from)?;
        let mut dec = Dec::new(&frame);
        let status = dec.i32().map_err(Error::from)?;
        if status != STATUS_OK {
            return Err(status_error(status));
        }
        let suffix = dec.blob().map_err(Error::from)?;
        String::from_utf8(suffix).map_err(|_| Error::BadValue)
    }

    /// The legacy encoded-descriptor entry point.
    pub fn allocate(&mut self, encoded: &[u8], count: i32) -> Result<AllocationResult> {
        let mut body = Vec::new();
        put_u32(&mut body, OP_ALLOCATE);
        put_u32(&mut body, encoded.len() as u32);
        body.extend_from_slice(encoded);
        put_i32(&mut body, count);
        write_frame(&mut self.stream, &body).map_err(Error::from)?;

        let frame = read_frame(&mut self.stream).map_err(Error::from)?;
        let mut dec = Dec::new(&frame);
        let status = dec.i32().map_err(Error::from)?;
        if status != STATUS_OK {
            return Err(status_error(status));
        }
        Err(Error::BadValue)
    }
}

fn write_frame(stream: &mut UnixStream, body: &[u8]) -> io::Result<()> {
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn read_frame(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_SIZE {
        return Err(invalid_data());
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn encode_descriptor(body: &mut Vec<u8>, desc: &BufferDescriptorInfo) {
    put_u32(body, desc.name.len() as u32);
    body.extend_from_slice(&desc.name);
    put_i32(body, desc.width);
    put_i32(body, desc.height);
    put_i32(body, desc.layer_count);
    put_i32(body, desc.format);
    put_u64(body, desc.usage);
    put_i64(body, desc.reserved_size);
    put_u32(body, desc.additional_options.len() as u32);
    for option in &desc.additional_options {
        put_u32(body, option.name.len() as u32);
        body.extend_from_slice(option.name.as_bytes());
        put_i64(body, option.value);
    }
}

fn decode_descriptor(dec: &mut Dec) -> io::Result<BufferDescriptorInfo> {
    let name = dec.blob()?;
    let width = dec.i32()?;
    let height = dec.i32()?;
    let layer_count = dec.i32()?;
    let format = dec.i32()?;
    let usage = dec.u64()?;
    let reserved_size = dec.i64()?;

    let option_count = dec.u32()?;
    let mut additional_options = Vec::with_capacity(option_count.min(64) as usize);
    for _ in 0..option_count {
        let name = dec.blob()?;
        let value = dec.i64()?;
        additional_options.push(ExtendableType {
            name: String::from_utf8(name).map_err(|_| invalid_data())?,
            value,
        });
    }

    Ok(BufferDescriptorInfo {
        name,
        width,
        height,
        layer_count,
        format,
        usage,
        reserved_size,
        additional_options,
    })
}

fn invalid_data() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "malformed frame")
}

fn put_u32(body: &mut Vec<u8>, value: u32) {
    body.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(body: &mut Vec<u8>, value: i32) {
    body.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(body: &mut Vec<u8>, value: u64) {
    body.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(body: &mut Vec<u8>, value: i64) {
    body.extend_from_slice(&value.to_le_bytes());
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> io::Result<&'a [u8]> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.buf.len() => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            _ => Err(invalid_data()),
        }
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> io::Result<i32> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> io::Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn blob(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u32()?;
        if len > MAX_FRAME_SIZE {
            return Err(invalid_data());
        }
        Ok(self.bytes(len as usize)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, descriptor, FakePipes};
    use rbm::address_space::MemfdAllocator;
    use rbm::handle::BufferHandle;
    use rbm::{BufferUsage as Usage, PixelFormat};

    const CPU_RW: u64 = 0x33;

    fn spawn_service() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allocator.sock");

        let (conn, _state) = test_support::fake_connection();
        let allocator = Arc::new(RanchuAllocator::new(
            conn,
            Arc::new(MemfdAllocator::new()),
            Arc::new(FakePipes::new()),
        ));

        let listener = UnixListener::bind(&path).unwrap();
        thread::spawn(move || {
            let _ = serve(listener, allocator);
        });

        (dir, path)
    }

    #[test]
    fn end_to_end_allocation() {
        let (_dir, path) = spawn_service();
        let mut client = AllocatorClient::connect(&path).unwrap();

        assert_eq!(client.imapper_library_suffix().unwrap(), "ranchu");

        let desc = descriptor(
            "wire",
            320,
            240,
            PixelFormat::Rgba8888,
            CPU_RW | Usage::GPU_TEXTURE.bits(),
        );
        assert!(client.is_supported(&desc).unwrap());

        let result = client.allocate2(&desc, 2).unwrap();
        assert_eq!(result.stride, 320);
        assert_eq!(result.buffers.len(), 2);

        for raw in result.buffers {
            assert_eq!(raw.fds.len(), 2);
            let mut cb = BufferHandle::from_raw(raw).unwrap();
            assert_eq!(cb.buffer_size, 320 * 240 * 4);
            assert_ne!(cb.host_handle, 0);

            cb.map_into_process().unwrap();
            assert_eq!(cb.external_metadata().width, 320);
        }
    }

    #[test]
    fn errors_cross_the_wire() {
        let (_dir, path) = spawn_service();
        let mut client = AllocatorClient::connect(&path).unwrap();

        let mut desc = descriptor("bad", 64, 64, PixelFormat::Rgba8888, CPU_RW);
        desc.layer_count = 2;
        assert!(matches!(
            client.allocate2(&desc, 1),
            Err(Error::BadDescriptor)
        ));
        assert!(!client.is_supported(&desc).unwrap());

        let desc = descriptor(
            "bad",
            64,
            64,
            PixelFormat::Rgb888,
            CPU_RW | Usage::GPU_TEXTURE.bits(),
        );
        assert!(matches!(
            client.allocate2(&desc, 1),
            Err(Error::Unsupported)
        ));

        assert!(matches!(
            client.allocate(&[0xde, 0xad], 1),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn socket_path_override() {
        std::env::set_var(SOCKET_ENV, "/tmp/rbm-test.sock");
        assert_eq!(
            default_socket_path(),
            PathBuf::from("/tmp/rbm-test.sock")
        );
        std::env::remove_var(SOCKET_ENV);
        assert!(default_socket_path().starts_with("/dev/socket"));
    }
}
