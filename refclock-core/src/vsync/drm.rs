// DRM VBLANK - Kernel Mode Setting vertical blank tracking (Linux)
//
// Talks to the DRM device node directly with ioctls, no libdrm needed.
//
// Pipeline:
// 1. Open the card node (default /dev/dri/card0)
// 2. Enumerate CRTCs, pick the configured one or the first with a mode set
// 3. Read the current vblank sequence (relative wait of 0)
// 4. Block on relative waits of 1 for each refresh
// 5. Read vrefresh/resolution from the CRTC mode for change detection

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::debug;

use super::{DisplayMode, VblankSource, VsyncError};

// ============================================================================
// DRM ioctl numbers (asm-generic _IOC layout)
// ============================================================================

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const IOC_READ_WRITE: u32 = 3;

const fn drm_iowr(nr: u32, size: usize) -> u32 {
    (IOC_READ_WRITE << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | nr
}

const DRM_IOCTL_WAIT_VBLANK: u32 = drm_iowr(0x3a, std::mem::size_of::<WaitVblank>());
const DRM_IOCTL_MODE_GETRESOURCES: u32 = drm_iowr(0xa0, std::mem::size_of::<ModeCardRes>());
const DRM_IOCTL_MODE_GETCRTC: u32 = drm_iowr(0xa1, std::mem::size_of::<ModeCrtc>());

// Vblank request type bits
const DRM_VBLANK_RELATIVE: u32 = 0x0000_0001;
const DRM_VBLANK_SECONDARY: u32 = 0x2000_0000;
const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;
const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;

// Mode flags
const DRM_MODE_FLAG_INTERLACE: u32 = 1 << 4;
const DRM_MODE_FLAG_DBLSCAN: u32 = 1 << 5;

// ============================================================================
// DRM structures (from drm.h / drm_mode.h)
// ============================================================================

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct WaitVblankRequest {
    kind: u32,
    sequence: u32,
    signal: libc::c_ulong,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct WaitVblankReply {
    kind: u32,
    sequence: u32,
    tval_sec: libc::c_long,
    tval_usec: libc::c_long,
}

#[repr(C)]
union WaitVblank {
    request: WaitVblankRequest,
    reply: WaitVblankReply,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default)]
struct ModeCardRes {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, Default)]
struct ModeInfo {
    clock: u32,
    hdisplay: u16,
    hsync_start: u16,
    hsync_end: u16,
    htotal: u16,
    hskew: u16,
    vdisplay: u16,
    vsync_start: u16,
    vsync_end: u16,
    vtotal: u16,
    vscan: u16,
    vrefresh: u32,
    flags: u32,
    kind: u32,
    name: [u8; 32],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default)]
struct ModeCrtc {
    set_connectors_ptr: u64,
    count_connectors: u32,
    crtc_id: u32,
    fb_id: u32,
    x: u32,
    y: u32,
    gamma_size: u32,
    mode_valid: u32,
    mode: ModeInfo,
}

// ============================================================================
// Helpers
// ============================================================================

fn drm_ioctl<T>(file: &File, request: u32, arg: &mut T, op: &'static str) -> Result<(), VsyncError> {
    loop {
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(VsyncError::Ioctl { op, source: err }),
        }
    }
}

/// Request type bits selecting CRTC `pipe`
fn pipe_bits(pipe: u32) -> u32 {
    match pipe {
        0 => 0,
        1 => DRM_VBLANK_SECONDARY,
        n => (n << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK,
    }
}

/// Refresh rate of a mode, rounded to whole Hz
fn mode_refresh_hz(mode: &ModeInfo) -> u32 {
    if mode.vrefresh > 0 {
        return mode.vrefresh;
    }
    if mode.htotal == 0 || mode.vtotal == 0 {
        return 0;
    }

    // clock is in kHz
    let mut rate = mode.clock as f64 * 1000.0 / (mode.htotal as f64 * mode.vtotal as f64);
    if mode.flags & DRM_MODE_FLAG_INTERLACE != 0 {
        rate *= 2.0;
    }
    if mode.flags & DRM_MODE_FLAG_DBLSCAN != 0 {
        rate /= 2.0;
    }
    if mode.vscan > 1 {
        rate /= mode.vscan as f64;
    }
    rate.round() as u32
}

fn get_crtc(file: &File, crtc_id: u32) -> Result<ModeCrtc, VsyncError> {
    let mut crtc = ModeCrtc {
        crtc_id,
        ..Default::default()
    };
    drm_ioctl(file, DRM_IOCTL_MODE_GETCRTC, &mut crtc, "DRM_IOCTL_MODE_GETCRTC")?;
    Ok(crtc)
}

fn crtc_ids(file: &File) -> Result<Vec<u32>, VsyncError> {
    let mut res = ModeCardRes::default();
    drm_ioctl(file, DRM_IOCTL_MODE_GETRESOURCES, &mut res, "DRM_IOCTL_MODE_GETRESOURCES")?;

    let mut ids = vec![0u32; res.count_crtcs as usize];
    if ids.is_empty() {
        return Ok(ids);
    }

    // Second pass fills only the CRTC array
    let mut res = ModeCardRes {
        crtc_id_ptr: ids.as_mut_ptr() as u64,
        count_crtcs: ids.len() as u32,
        ..Default::default()
    };
    drm_ioctl(file, DRM_IOCTL_MODE_GETRESOURCES, &mut res, "DRM_IOCTL_MODE_GETRESOURCES")?;
    ids.truncate(res.count_crtcs as usize);
    Ok(ids)
}

// ============================================================================
// DRM Source
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Crtc {
    id: u32,
    pipe: u32,
}

pub struct DrmSource {
    device: PathBuf,
    crtc_index: Option<u32>,
    file: Option<File>,
    crtc: Option<Crtc>,
}

impl DrmSource {
    pub fn new(device: PathBuf, crtc_index: Option<u32>) -> Self {
        Self {
            device,
            crtc_index,
            file: None,
            crtc: None,
        }
    }

    fn open(&self) -> Result<File, VsyncError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.device)
            .map_err(|source| VsyncError::Device {
                path: self.device.clone(),
                source,
            })
    }

    fn pick_crtc(&self, file: &File) -> Result<Crtc, VsyncError> {
        let ids = crtc_ids(file)?;
        debug!("DRM: {} CRTCs on {:?}", ids.len(), self.device);

        if let Some(index) = self.crtc_index {
            let id = *ids.get(index as usize).ok_or(VsyncError::NoActiveCrtc)?;
            return Ok(Crtc { id, pipe: index });
        }

        for (pipe, &id) in ids.iter().enumerate() {
            match get_crtc(file, id) {
                Ok(crtc) if crtc.mode_valid != 0 => {
                    return Ok(Crtc {
                        id,
                        pipe: pipe as u32,
                    })
                }
                Ok(_) => {}
                Err(e) => debug!("DRM: skipping CRTC {}: {}", id, e),
            }
        }
        Err(VsyncError::NoActiveCrtc)
    }

    fn wait(&self, count: u32) -> Result<u64, VsyncError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| VsyncError::Lost("device not open".into()))?;
        let crtc = self.crtc.ok_or(VsyncError::NoActiveCrtc)?;

        let mut vbl = WaitVblank {
            request: WaitVblankRequest {
                kind: DRM_VBLANK_RELATIVE | pipe_bits(crtc.pipe),
                sequence: count,
                signal: 0,
            },
        };
        drm_ioctl(file, DRM_IOCTL_WAIT_VBLANK, &mut vbl, "DRM_IOCTL_WAIT_VBLANK")?;

        // The kernel overwrote the request with the reply
        let reply = unsafe { vbl.reply };
        Ok(reply.sequence as u64)
    }
}

impl VblankSource for DrmSource {
    fn name(&self) -> &'static str {
        "drm"
    }

    fn setup(&mut self) -> Result<u64, VsyncError> {
        debug!("DRM: setting up vblank tracking on {:?}", self.device);

        let file = self.open()?;
        let crtc = self.pick_crtc(&file)?;
        debug!("DRM: using CRTC {} (pipe {})", crtc.id, crtc.pipe);

        self.file = Some(file);
        self.crtc = Some(crtc);

        match self.wait(0) {
            Ok(sequence) => Ok(sequence),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    fn wait_for_vblank(&mut self) -> Result<Option<u64>, VsyncError> {
        self.wait(1).map(Some)
    }

    fn display_mode(&mut self) -> Result<DisplayMode, VsyncError> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| VsyncError::Lost("device not open".into()))?;
        let crtc = self.crtc.ok_or(VsyncError::NoActiveCrtc)?;

        let info = get_crtc(file, crtc.id)?;
        if info.mode_valid == 0 {
            return Err(VsyncError::NoActiveCrtc);
        }
        Ok(DisplayMode::new(
            mode_refresh_hz(&info.mode),
            info.mode.hdisplay as u32,
            info.mode.vdisplay as u32,
        ))
    }

    fn resync(&mut self) -> Result<(), VsyncError> {
        // Reopening the node drops any stale per-file vblank state
        debug!("DRM: reopening {:?}", self.device);
        self.file = None;
        self.file = Some(self.open()?);
        self.wait(0).map(|_| ())
    }

    fn teardown(&mut self) {
        if self.file.take().is_some() {
            debug!("DRM: cleaning up {:?}", self.device);
        }
        self.crtc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout() {
        assert_eq!(std::mem::size_of::<ModeCardRes>(), 64);
        assert_eq!(std::mem::size_of::<ModeInfo>(), 68);
        assert_eq!(std::mem::size_of::<ModeCrtc>(), 104);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(DRM_IOCTL_WAIT_VBLANK, 0xc018_643a);
        assert_eq!(DRM_IOCTL_MODE_GETRESOURCES, 0xc040_64a0);
        assert_eq!(DRM_IOCTL_MODE_GETCRTC, 0xc068_64a1);
    }

    #[test]
    fn test_pipe_bits() {
        assert_eq!(pipe_bits(0), 0);
        assert_eq!(pipe_bits(1), DRM_VBLANK_SECONDARY);
        assert_eq!(pipe_bits(2), 0x04);
        assert_eq!(pipe_bits(3), 0x06);
    }

    #[test]
    fn test_mode_refresh_from_timings() {
        let mut mode = ModeInfo {
            vrefresh: 60,
            ..Default::default()
        };
        assert_eq!(mode_refresh_hz(&mode), 60);

        // 1080p50: 148.5 MHz, 2640 x 1125
        mode.vrefresh = 0;
        mode.clock = 148_500;
        mode.htotal = 2640;
        mode.vtotal = 1125;
        assert_eq!(mode_refresh_hz(&mode), 50);

        // 1080i: 74.25 MHz, 2200 x 1125, interlaced
        mode.clock = 74_250;
        mode.htotal = 2200;
        mode.flags = DRM_MODE_FLAG_INTERLACE;
        assert_eq!(mode_refresh_hz(&mode), 60);

        mode.htotal = 0;
        assert_eq!(mode_refresh_hz(&mode), 0);
    }

    #[test]
    fn test_setup_missing_device() {
        let mut source = DrmSource::new(PathBuf::from("/nonexistent/dri/card9"), None);
        assert!(matches!(source.setup(), Err(VsyncError::Device { .. })));
        assert!(source.wait_for_vblank().is_err());
        source.teardown();
    }
}
