// Test pattern for the producer: horizontal gradient with a bar that moves
// one column per frame.

use softcam_core::BYTES_PER_PIXEL;

const BAR_WIDTH: usize = 8;

pub fn render(frame: &mut [u8], width: usize, height: usize, frame_index: u64) {
    if width == 0 || height == 0 {
        return;
    }
    let bar = (frame_index as usize) % width;

    for (y, row) in frame
        .chunks_exact_mut(width * BYTES_PER_PIXEL)
        .take(height)
        .enumerate()
    {
        for (x, px) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let in_bar = x >= bar && x < bar + BAR_WIDTH;
            if in_bar {
                px.copy_from_slice(&[255, 255, 255]);
            } else {
                px[0] = (x * 255 / width) as u8;
                px[1] = (y * 255 / height) as u8;
                px[2] = (frame_index & 0xff) as u8;
            }
        }
    }
}

/// FNV-1a over the frame, to spot torn or repeated frames in logs
pub fn checksum(frame: &[u8]) -> u32 {
    frame.iter().fold(0x811c_9dc5u32, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_moves_between_frames() {
        let (w, h) = (32, 4);
        let mut a = vec![0u8; w * h * BYTES_PER_PIXEL];
        let mut b = a.clone();
        render(&mut a, w, h, 0);
        render(&mut b, w, h, 1);

        assert_ne!(checksum(&a), checksum(&b));
        assert_eq!(&a[..3], &[255, 255, 255]);
        assert_ne!(&b[..3], &[255, 255, 255]);
    }

    #[test]
    fn test_render_ignores_empty_frame() {
        let mut frame = Vec::new();
        render(&mut frame, 0, 0, 5);
        assert!(frame.is_empty());
    }
}
