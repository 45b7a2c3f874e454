//! DXGI Desktop Duplication output factory.
//!
//! Each [`DxgiOutput`] wraps the `IDXGIOutputDuplication` pipeline for a
//! single monitor:
//!
//! 1. Find the adapter/output whose `DeviceName` matches.
//! 2. Create a D3D11 device on that adapter and duplicate the output.
//! 3. Per acquisition: `AcquireNextFrame`, read dirty rects, copy the
//!    desktop texture into a CPU-readable staging texture, map, copy
//!    rows out, unmap, `ReleaseFrame`.

use std::mem::size_of;
use std::time::Duration;

use windows::{
    Win32::{
        Foundation::{HMODULE, RECT},
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_UNKNOWN,
            Direct3D11::{
                D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAP_READ,
                D3D11_MAPPED_SUBRESOURCE, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC,
                D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext,
                ID3D11Texture2D,
            },
            Dxgi::{
                Common::{
                    DXGI_MODE_ROTATION_ROTATE90, DXGI_MODE_ROTATION_ROTATE180,
                    DXGI_MODE_ROTATION_ROTATE270, DXGI_SAMPLE_DESC,
                },
                CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, DXGI_ERROR_WAIT_TIMEOUT,
                DXGI_OUTDUPL_FRAME_INFO, IDXGIAdapter, IDXGIFactory1, IDXGIOutput1,
                IDXGIOutputDuplication, IDXGIResource,
            },
        },
    },
    core::Interface,
};

use crate::capture::{AcquireError, AcquiredFrame, NativeOutput, OutputFactory, OutputHandle};
use crate::error::{DeskcastError, Result};
use crate::types::{Frame, PixelFormat, Rect, Rotation};

fn os_error(context: &str, err: windows::core::Error) -> DeskcastError {
    DeskcastError::Capture(format!("{context} failed: {err}"))
}

/// Decode a fixed-size, NUL-terminated UTF-16 buffer.
pub(super) fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

// ── DxgiOutputFactory ────────────────────────────────────────────

/// Creates [`DxgiOutput`]s by GDI device name (`\\.\DISPLAY1`).
#[derive(Debug, Default)]
pub struct DxgiOutputFactory;

impl DxgiOutputFactory {
    pub fn new() -> Self {
        Self
    }
}

impl OutputFactory for DxgiOutputFactory {
    type Handle = DxgiOutput;

    fn create(&mut self, device_name: &str) -> Result<NativeOutput<DxgiOutput>> {
        unsafe {
            let factory: IDXGIFactory1 =
                CreateDXGIFactory1().map_err(|e| os_error("CreateDXGIFactory1", e))?;

            for adapter_index in 0.. {
                let adapter = match factory.EnumAdapters1(adapter_index) {
                    Ok(adapter) => adapter,
                    Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                    Err(e) => return Err(os_error("EnumAdapters1", e)),
                };
                let adapter: IDXGIAdapter = adapter.cast().map_err(|e| os_error("cast<IDXGIAdapter>", e))?;

                for output_index in 0.. {
                    let output = match adapter.EnumOutputs(output_index) {
                        Ok(output) => output,
                        Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
                        Err(e) => return Err(os_error("EnumOutputs", e)),
                    };
                    let desc = output.GetDesc().map_err(|e| os_error("IDXGIOutput::GetDesc", e))?;
                    if wide_to_string(&desc.DeviceName) != device_name {
                        continue;
                    }

                    let (device, context) = create_device(&adapter)?;
                    let output1: IDXGIOutput1 =
                        output.cast().map_err(|e| os_error("cast<IDXGIOutput1>", e))?;
                    let duplication = output1
                        .DuplicateOutput(&device)
                        .map_err(|e| os_error("DuplicateOutput", e))?;

                    let coords = desc.DesktopCoordinates;
                    let (w, h) = (
                        (coords.right - coords.left).max(1) as u32,
                        (coords.bottom - coords.top).max(1) as u32,
                    );
                    let rotation = match desc.Rotation {
                        DXGI_MODE_ROTATION_ROTATE90 => Rotation::Rotate90,
                        DXGI_MODE_ROTATION_ROTATE180 => Rotation::Rotate180,
                        DXGI_MODE_ROTATION_ROTATE270 => Rotation::Rotate270,
                        _ => Rotation::Identity,
                    };
                    // DesktopCoordinates are post-rotation; the texture is not.
                    let bounds = match rotation {
                        Rotation::Rotate90 | Rotation::Rotate270 => Rect::new(0, 0, h, w),
                        _ => Rect::new(0, 0, w, h),
                    };

                    return Ok(NativeOutput {
                        handle: DxgiOutput {
                            device,
                            context,
                            duplication,
                            staging: None,
                        },
                        bounds,
                        rotation,
                    });
                }
            }
        }

        Err(DeskcastError::DisplayNotFound(device_name.to_string()))
    }
}

unsafe fn create_device(adapter: &IDXGIAdapter) -> Result<(ID3D11Device, ID3D11DeviceContext)> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| os_error("D3D11CreateDevice", e))?;
    }
    let device = device.ok_or_else(|| DeskcastError::Capture("D3D11 device is None".into()))?;
    let context = context.ok_or_else(|| DeskcastError::Capture("D3D11 context is None".into()))?;
    Ok((device, context))
}

// ── DxgiOutput ───────────────────────────────────────────────────

/// A live duplication of one monitor.
pub struct DxgiOutput {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplication: IDXGIOutputDuplication,
    /// CPU-readable copy target, recreated when the desktop size changes.
    staging: Option<(ID3D11Texture2D, u32, u32)>,
}

// SAFETY: the D3D11 device, its immediate context and the duplication are
// only ever touched from the capture task that owns this value.
unsafe impl Send for DxgiOutput {}

impl OutputHandle for DxgiOutput {
    fn acquire_frame(&mut self, timeout: Duration) -> std::result::Result<AcquiredFrame, AcquireError> {
        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;

        unsafe {
            match self
                .duplication
                .AcquireNextFrame(timeout.as_millis() as u32, &mut info, &mut resource)
            {
                Ok(()) => {}
                Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Err(AcquireError::Timeout),
                Err(e) => return Err(AcquireError::Fault(format!("AcquireNextFrame failed: {e}"))),
            }

            let result = self.read_frame(&info, resource);
            let _ = self.duplication.ReleaseFrame();
            result
        }
    }
}

impl DxgiOutput {
    unsafe fn read_frame(
        &mut self,
        info: &DXGI_OUTDUPL_FRAME_INFO,
        resource: Option<IDXGIResource>,
    ) -> std::result::Result<AcquiredFrame, AcquireError> {
        let fault = |context: &str, e: windows::core::Error| AcquireError::Fault(format!("{context} failed: {e}"));

        if info.AccumulatedFrames == 0 {
            return Ok(AcquiredFrame {
                accumulated_frames: 0,
                frame: None,
                dirty_rects: Vec::new(),
            });
        }

        let resource = resource.ok_or_else(|| AcquireError::Fault("acquired resource is None".into()))?;
        let texture: ID3D11Texture2D = resource.cast().map_err(|e| fault("cast<ID3D11Texture2D>", e))?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        let (width, height) = (desc.Width, desc.Height);

        let dirty_rects = unsafe { self.dirty_rects(info.TotalMetadataBufferSize) };
        let staging = unsafe { self.staging_texture(width, height) }?;

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        let data = unsafe {
            self.context.CopyResource(&staging, &texture);
            self.context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| fault("Map", e))?;
            let len = mapped.RowPitch as usize * height as usize;
            let data = std::slice::from_raw_parts(mapped.pData as *const u8, len).to_vec();
            self.context.Unmap(&staging, 0);
            data
        };

        let frame = Frame::from_raw(width, height, mapped.RowPitch, PixelFormat::Bgra8, data)
            .map_err(|e| AcquireError::Fault(e.to_string()))?;

        Ok(AcquiredFrame {
            accumulated_frames: info.AccumulatedFrames,
            frame: Some(frame),
            dirty_rects,
        })
    }

    /// Dirty rects of the acquired frame. Transient query failures yield
    /// an empty list rather than a fault.
    unsafe fn dirty_rects(&self, metadata_size: u32) -> Vec<Rect> {
        let capacity = metadata_size as usize / size_of::<RECT>();
        if capacity == 0 {
            return Vec::new();
        }
        let mut rects = vec![RECT::default(); capacity];
        let mut required = 0u32;
        let ok = unsafe {
            self.duplication.GetFrameDirtyRects(
                (capacity * size_of::<RECT>()) as u32,
                rects.as_mut_ptr(),
                &mut required,
            )
        };
        if ok.is_err() {
            return Vec::new();
        }
        let count = required as usize / size_of::<RECT>();
        rects
            .iter()
            .take(count)
            .map(|r| {
                Rect::from_edges(
                    r.left.max(0) as u32,
                    r.top.max(0) as u32,
                    r.right.max(0) as u32,
                    r.bottom.max(0) as u32,
                )
            })
            .collect()
    }

    unsafe fn staging_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> std::result::Result<ID3D11Texture2D, AcquireError> {
        if let Some((texture, w, h)) = &self.staging {
            if *w == width && *h == height {
                return Ok(texture.clone());
            }
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut texture = None;
        unsafe {
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|e| AcquireError::Fault(format!("CreateTexture2D (staging) failed: {e}")))?;
        }
        let texture = texture.ok_or_else(|| AcquireError::Fault("staging texture is None".into()))?;
        self.staging = Some((texture.clone(), width, height));
        Ok(texture)
    }
}
